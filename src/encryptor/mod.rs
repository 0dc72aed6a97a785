use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use log::info;

use crate::configuration::Encryption;
use crate::error::EncryptionError;
use crate::helper::process::{self, Cancellation};

pub trait Encryptor: Send + Sync {
    fn id(&self) -> &str;

    /// Suffix the encrypted artifact carries after the compressed name.
    fn extension(&self) -> &str;

    /// Encrypts `input` and returns the path of the encrypted file.
    fn encrypt(&self, input: &Path, cancel: &Cancellation) -> Result<PathBuf, EncryptionError>;

    /// Produces `plain_target` from `plain_target` + extension.
    fn decrypt(&self, plain_target: &Path, cancel: &Cancellation) -> Result<(), EncryptionError>;
}

/// Runs the configured cipher program with the recipe's rendered parameters.
pub struct ExternalProgram {
    recipe: Encryption,
}

impl ExternalProgram {
    pub fn new(recipe: &Encryption) -> Self {
        Self {
            recipe: recipe.clone(),
        }
    }

    pub fn create(recipe: &Encryption) -> Arc<dyn Encryptor> {
        Arc::new(Self::new(recipe))
    }

    fn program_error(&self, cause: crate::error::ProcessError) -> EncryptionError {
        EncryptionError::Program {
            recipe: self.recipe.id.clone(),
            cause,
        }
    }

    fn invoke(
        &self,
        arguments: Vec<String>,
        expected_output: &Path,
        cancel: &Cancellation,
    ) -> Result<(), EncryptionError> {
        let mut command = Command::new(&self.recipe.program);
        command.args(arguments).stdout(Stdio::null());
        process::run(command, cancel).map_err(|cause| self.program_error(cause))?;

        if !expected_output.is_file() {
            return Err(EncryptionError::MissingOutput {
                recipe: self.recipe.id.clone(),
                output: expected_output.to_path_buf(),
            });
        }
        Ok(())
    }
}

impl Encryptor for ExternalProgram {
    fn id(&self) -> &str {
        &self.recipe.id
    }

    fn extension(&self) -> &str {
        &self.recipe.extension
    }

    fn encrypt(&self, input: &Path, cancel: &Cancellation) -> Result<PathBuf, EncryptionError> {
        info!("encrypting '{}' with '{}'", input.display(), self.recipe.id);
        let output = self.recipe.output_path(input);
        let arguments = Encryption::render_arguments(&self.recipe.parameters, input);
        self.invoke(arguments, &output, cancel)?;

        info!("encrypting '{}' completed!", input.display());
        Ok(output)
    }

    fn decrypt(&self, plain_target: &Path, cancel: &Cancellation) -> Result<(), EncryptionError> {
        if self.recipe.decrypt_parameters.is_empty() {
            return Err(EncryptionError::NoDecryptParameters {
                recipe: self.recipe.id.clone(),
            });
        }

        info!("decrypting into '{}'", plain_target.display());
        let arguments = Encryption::render_arguments(&self.recipe.decrypt_parameters, plain_target);
        self.invoke(arguments, plain_target, cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::configuration::ProgramParameter;

    fn base64_recipe() -> Encryption {
        let mut recipe = Encryption::new();
        recipe.id = String::from("b64");
        recipe.program = String::from("sh");
        recipe.parameters = vec![
            ProgramParameter::short("c", Some("base64 '{filename}' > '{filename}.enc'")),
        ];
        recipe.decrypt_parameters = vec![
            ProgramParameter::short("c", Some("base64 -d '{filename}.enc' > '{filename}'")),
        ];
        recipe
    }

    #[test]
    fn test_round_trip_through_external_program() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("nightly.tar");
        fs::write(&plain, b"archive content").unwrap();

        let encryptor = ExternalProgram::new(&base64_recipe());
        let encrypted = encryptor.encrypt(&plain, &Cancellation::new()).unwrap();
        assert_eq!(encrypted, temp_dir.path().join("nightly.tar.enc"));
        assert_ne!(fs::read(&encrypted).unwrap(), b"archive content");

        fs::remove_file(&plain).unwrap();
        encryptor.decrypt(&plain, &Cancellation::new()).unwrap();
        assert_eq!(fs::read(&plain).unwrap(), b"archive content");
    }

    #[test]
    fn test_failing_program_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("nightly.tar");
        fs::write(&plain, b"archive content").unwrap();

        let mut recipe = base64_recipe();
        recipe.parameters = vec![ProgramParameter::short("c", Some("echo 'bad key' >&2; exit 3"))];
        let err = ExternalProgram::new(&recipe)
            .encrypt(&plain, &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, EncryptionError::Program { recipe, .. } if recipe == "b64"));
    }

    #[test]
    fn test_missing_output_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("nightly.tar");
        fs::write(&plain, b"archive content").unwrap();

        let mut recipe = base64_recipe();
        recipe.parameters = vec![ProgramParameter::short("c", Some("true"))];
        let err = ExternalProgram::new(&recipe)
            .encrypt(&plain, &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, EncryptionError::MissingOutput { .. }));
    }

    #[test]
    fn test_decrypt_requires_parameters() {
        let mut recipe = base64_recipe();
        recipe.decrypt_parameters.clear();
        let err = ExternalProgram::new(&recipe)
            .decrypt(Path::new("/tmp/never.tar"), &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, EncryptionError::NoDecryptParameters { .. }));
    }
}
