use std::path::{Path, PathBuf};

use crate::configuration::ProgramParameter;

/// A reusable invocation of an external cipher program.
#[derive(Clone, Debug)]
pub struct Encryption {
    pub id: String,
    pub program: String,
    pub extension: String,
    pub parameters: Vec<ProgramParameter>,
    pub decrypt_parameters: Vec<ProgramParameter>,
    /// Legacy shorthand: `cipher` + `password` expand to an openssl recipe.
    pub cipher: String,
    pub password: String,
}

impl Encryption {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            program: String::new(),
            extension: String::from(".enc"),
            parameters: Vec::new(),
            decrypt_parameters: Vec::new(),
            cipher: String::new(),
            password: String::new(),
        }
    }

    /// Fills program and parameters from `cipher`/`password` when no explicit
    /// parameter list was configured.
    pub fn apply_openssl_shorthand(&mut self) {
        if !self.parameters.is_empty() || self.cipher.is_empty() {
            return;
        }

        if self.program.is_empty() {
            self.program = String::from("openssl");
        }
        let output = format!("{{filename}}{}", self.extension);
        self.parameters = vec![
            ProgramParameter::literal(self.cipher.as_str()),
            ProgramParameter::short("pbkdf2", None),
            ProgramParameter::short("in", Some("{filename}")),
            ProgramParameter::short("out", Some(output.as_str())),
            ProgramParameter::short("k", Some(self.password.as_str())),
        ];
        self.decrypt_parameters = vec![
            ProgramParameter::literal(self.cipher.as_str()),
            ProgramParameter::short("d", None),
            ProgramParameter::short("pbkdf2", None),
            ProgramParameter::short("in", Some(output.as_str())),
            ProgramParameter::short("out", Some("{filename}")),
            ProgramParameter::short("k", Some(self.password.as_str())),
        ];
    }

    pub fn render_arguments(parameters: &[ProgramParameter], filename: &Path) -> Vec<String> {
        let filename = filename.to_string_lossy();
        parameters
            .iter()
            .flat_map(|parameter| parameter.render(&filename))
            .collect()
    }

    /// The file the program is expected to write for `input`.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let mut output = input.as_os_str().to_owned();
        output.push(&self.extension);
        PathBuf::from(output)
    }
}
