/// Placeholder replaced by the path of the working file.
pub const FILENAME_PLACEHOLDER: &str = "{filename}";

/// One parameter of an external program invocation.
///
/// `longname` renders as `--name`, `shortname` as `-name`. With a value the
/// name and value are joined by `assign_sign`; an assign-sign of a single
/// space emits them as two separate arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramParameter {
    pub longname: Option<String>,
    pub shortname: Option<String>,
    pub value: Option<String>,
    pub assign_sign: String,
}

impl ProgramParameter {
    pub fn new() -> ProgramParameter {
        ProgramParameter {
            longname: None,
            shortname: None,
            value: None,
            assign_sign: String::from("="),
        }
    }

    pub fn literal<S: Into<String>>(value: S) -> ProgramParameter {
        ProgramParameter {
            value: Some(value.into()),
            ..ProgramParameter::new()
        }
    }

    pub fn short<S: Into<String>>(name: S, value: Option<&str>) -> ProgramParameter {
        ProgramParameter {
            shortname: Some(name.into()),
            value: value.map(String::from),
            assign_sign: String::from(" "),
            ..ProgramParameter::new()
        }
    }

    pub fn render(&self, filename: &str) -> Vec<String> {
        let name = match (&self.longname, &self.shortname) {
            (Some(longname), _) => Some(format!("--{}", longname)),
            (None, Some(shortname)) => Some(format!("-{}", shortname)),
            (None, None) => None,
        };
        let value = self
            .value
            .as_ref()
            .map(|value| value.replace(FILENAME_PLACEHOLDER, filename));

        match (name, value) {
            (Some(name), Some(value)) => {
                if self.assign_sign == " " {
                    vec![name, value]
                } else {
                    vec![format!("{}{}{}", name, self.assign_sign, value)]
                }
            }
            (Some(name), None) => vec![name],
            (None, Some(value)) => vec![value],
            (None, None) => Vec::new(),
        }
    }
}
