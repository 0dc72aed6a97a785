use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::TemplateError;

/// Source of the run timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Values placeholders are evaluated against. Captured once per archive run.
#[derive(Clone, Copy, Debug)]
pub struct RenderContext {
    pub timestamp: DateTime<Utc>,
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// An archive name such as `backup-{date:year}-{date:month}-{date:day}`.
#[derive(Clone, Debug, PartialEq)]
pub struct NameTemplate {
    template: String,
}

impl NameTemplate {
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Text before the first placeholder. Every rendered name starts with it.
    pub fn literal_prefix(&self) -> &str {
        match self.template.find('{') {
            Some(index) => &self.template[..index],
            None => &self.template,
        }
    }

    /// Checks that every placeholder is known without rendering.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for segment in self.segments()? {
            if let Segment::Placeholder(name) = segment {
                if !is_known(name) {
                    return Err(self.unknown(name));
                }
            }
        }
        Ok(())
    }

    pub fn render(&self, context: &RenderContext) -> Result<String, TemplateError> {
        let mut name = String::with_capacity(self.template.len() + 16);
        for segment in self.segments()? {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Placeholder(placeholder) => {
                    let value = resolve(placeholder, &context.timestamp)
                        .ok_or_else(|| self.unknown(placeholder))?;
                    name.push_str(&value);
                }
            }
        }

        if name.trim().is_empty() {
            return Err(TemplateError::Empty {
                template: self.template.clone(),
            });
        }
        check_file_name(&name)?;

        Ok(name)
    }

    fn segments(&self) -> Result<Vec<Segment<'_>>, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(&rest[..open]));
            }
            let close = rest[open..]
                .find('}')
                .ok_or_else(|| TemplateError::Unterminated {
                    template: self.template.clone(),
                })?;
            segments.push(Segment::Placeholder(&rest[open + 1..open + close]));
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest));
        }
        Ok(segments)
    }

    fn unknown(&self, placeholder: &str) -> TemplateError {
        TemplateError::UnknownPlaceholder {
            template: self.template.clone(),
            placeholder: format!("{{{}}}", placeholder),
        }
    }
}

fn is_known(placeholder: &str) -> bool {
    resolve(placeholder, &DateTime::<Utc>::default()).is_some()
}

fn resolve(placeholder: &str, timestamp: &DateTime<Utc>) -> Option<String> {
    let value = match placeholder {
        "date:year" => format!("{:04}", timestamp.year()),
        "date:month" => format!("{:02}", timestamp.month()),
        "date:day" => format!("{:02}", timestamp.day()),
        "date:weekday" => timestamp.weekday().to_string(),
        "time:hour" => format!("{:02}", timestamp.hour()),
        "time:minute" => format!("{:02}", timestamp.minute()),
        "time:second" => format!("{:02}", timestamp.second()),
        _ => return None,
    };
    Some(value)
}

fn check_file_name(name: &str) -> Result<(), TemplateError> {
    let reason = if name.contains(['/', '\\']) {
        "contains a path separator"
    } else if name.contains('\0') {
        "contains a NUL character"
    } else if name == "." || name == ".." {
        "is a relative directory reference"
    } else {
        return Ok(());
    };

    Err(TemplateError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
