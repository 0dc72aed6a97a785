use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::configuration::Database;
use crate::error::SourceError;
use crate::helper::process::Cancellation;

use super::{
    dump_error, dump_to_file, enumerate_error, import_from_file, list_units, restore_error,
    DumpedUnit, SourceAdapter,
};

/// Prints every database, followed by its collections as `<database>.<collection>`.
const LIST_UNITS: &str = r#"db.adminCommand({ listDatabases: 1, nameOnly: true }).databases.forEach(d => {
    print(d.name);
    db.getSiblingDB(d.name).getCollectionNames().forEach(c => print(d.name + "." + c));
});"#;

/// MongoDB units are whole databases (`shop`) or single collections
/// (`shop.orders`). The password never appears on a command line: mongosh
/// authenticates from a script file and the database tools read a
/// `--config` file, both readable by the owner only.
pub struct MongoDbSource {
    database: Database,
}

impl MongoDbSource {
    pub fn new(database: &Database) -> Self {
        Self {
            database: database.clone(),
        }
    }

    pub fn create(database: &Database) -> Arc<dyn SourceAdapter> {
        Arc::new(Self::new(database))
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(self.database.tool(program));
        let credential = &self.database.credential;
        if !credential.username.is_empty() {
            cmd.arg(format!("--username={}", credential.username));
        }
        if let Some(host) = &self.database.host {
            cmd.arg(format!("--host={}", host));
        }
        if let Some(port) = self.database.port {
            cmd.arg(format!("--port={}", port));
        }
        cmd
    }

    /// The `--config` file for mongodump and mongorestore, none without a password.
    fn tool_config(&self, directory: Option<&Path>) -> io::Result<Option<NamedTempFile>> {
        let password = &self.database.credential.password;
        if password.is_empty() {
            return Ok(None);
        }
        private_file(directory, &format!("password: {}\n", quoted(password))).map(Some)
    }

    fn listing_script(&self) -> String {
        let credential = &self.database.credential;
        let mut script = format!(
            "db = connect({});\n",
            quoted(&format!(
                "mongodb://{}:{}/admin",
                self.database.host.as_deref().unwrap_or("localhost"),
                self.database.port.unwrap_or(27017)
            ))
        );
        if !credential.username.is_empty() {
            script.push_str(&format!(
                "db.auth({}, {});\n",
                quoted(&credential.username),
                quoted(&credential.password)
            ));
        }
        script.push_str(LIST_UNITS);
        script.push('\n');
        script
    }
}

impl SourceAdapter for MongoDbSource {
    fn id(&self) -> &str {
        &self.database.id
    }

    fn entry_extension(&self) -> &str {
        ".bson"
    }

    /// Every database and every collection visible to the configured credentials.
    fn enumerate(&self, cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
        let script = private_file(None, &self.listing_script())
            .map_err(|err| enumerate_error(self.id(), err))?;
        let mut cmd = Command::new(self.database.tool("mongosh"));
        cmd.arg("--quiet").arg("--nodb").arg("--file").arg(script.path());

        list_units(self.id(), cmd, cancel)
    }

    /// A selected database already contains its collections.
    fn collapse(&self, units: Vec<String>) -> Vec<String> {
        let databases: HashSet<String> = units
            .iter()
            .filter(|unit| split_unit(unit).1.is_none())
            .cloned()
            .collect();
        units
            .into_iter()
            .filter(|unit| match split_unit(unit) {
                (database, Some(_)) => !databases.contains(database),
                (_, None) => true,
            })
            .collect()
    }

    fn dump(
        &self,
        unit: &str,
        workspace: &Path,
        cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError> {
        let config = self
            .tool_config(Some(workspace))
            .map_err(|err| dump_error(self.id(), unit, err))?;

        let mut cmd = self.command("mongodump");
        if let Some(config) = &config {
            cmd.arg(format!("--config={}", config.path().display()));
        }
        cmd.arg("--archive");
        match split_unit(unit) {
            (database, Some(collection)) => {
                cmd.arg(format!("--db={}", database))
                    .arg(format!("--collection={}", collection));
            }
            (database, None) => {
                cmd.arg(format!("--db={}", database));
            }
        }

        dump_to_file(self.id(), unit, self.entry_extension(), cmd, workspace, cancel)
    }

    fn restore(&self, unit: &str, dump: &Path, cancel: &Cancellation) -> Result<(), SourceError> {
        let config = self
            .tool_config(dump.parent())
            .map_err(|err| restore_error(self.id(), unit, err))?;

        let mut cmd = self.command("mongorestore");
        if let Some(config) = &config {
            cmd.arg(format!("--config={}", config.path().display()));
        }
        let namespace = match split_unit(unit) {
            (_, Some(_)) => unit.to_string(),
            (database, None) => format!("{}.*", database),
        };
        cmd.arg("--archive")
            .arg("--drop")
            .arg("--preserveUUID")
            .arg(format!("--nsInclude={}", namespace));

        import_from_file(self.id(), unit, cmd, dump, cancel)
    }
}

/// Database names cannot contain dots, collection names can.
fn split_unit(unit: &str) -> (&str, Option<&str>) {
    match unit.split_once('.') {
        Some((database, collection)) => (database, Some(collection)),
        None => (unit, None),
    }
}

/// A double quoted string literal, valid in JavaScript and YAML alike.
fn quoted(value: &str) -> String {
    let mut literal = String::with_capacity(value.len() + 2);
    literal.push('"');
    for c in value.chars() {
        match c {
            '"' => literal.push_str("\\\""),
            '\\' => literal.push_str("\\\\"),
            '\n' => literal.push_str("\\n"),
            '\r' => literal.push_str("\\r"),
            '\t' => literal.push_str("\\t"),
            c => literal.push(c),
        }
    }
    literal.push('"');
    literal
}

/// Temporary files are created with mode 0600.
fn private_file(directory: Option<&Path>, contents: &str) -> io::Result<NamedTempFile> {
    let mut file = match directory {
        Some(directory) => NamedTempFile::new_in(directory)?,
        None => NamedTempFile::new()?,
    };
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}
