use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use crate::configuration::Database;
use crate::error::SourceError;
use crate::helper::process::{self, Cancellation};

use super::{dump_to_file, import_from_file, list_units, restore_error, DumpedUnit, SourceAdapter};

/// Schemas that mysqldump refuses to dump.
const SYSTEM_SCHEMAS: [&str; 2] = ["information_schema", "performance_schema"];

pub struct MySqlSource {
    database: Database,
}

impl MySqlSource {
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
            cmd.arg("-u").arg(&credential.username);
            if !credential.password.is_empty() {
                cmd.env("MYSQL_PWD", &credential.password);
            }
        }
        if let Some(host) = &self.database.host {
            cmd.arg(format!("--host={}", host));
        }
        if let Some(port) = self.database.port {
            cmd.arg(format!("--port={}", port));
        }
        cmd
    }
}

impl SourceAdapter for MySqlSource {
    fn id(&self) -> &str {
        &self.database.id
    }

    fn entry_extension(&self) -> &str {
        ".sql"
    }

    fn enumerate(&self, cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
        let mut cmd = self.command("mysql");
        cmd.arg("-N").arg("-B").arg("-e").arg("SHOW DATABASES");

        let units = list_units(self.id(), cmd, cancel)?;
        Ok(units
            .into_iter()
            .filter(|unit| !SYSTEM_SCHEMAS.contains(&unit.as_str()))
            .collect())
    }

    fn dump(
        &self,
        unit: &str,
        workspace: &Path,
        cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError> {
        let mut cmd = self.command("mysqldump");
        cmd.arg("--single-transaction")
            .arg("--routines")
            .arg("--events")
            .arg("--databases")
            .arg(unit);

        dump_to_file(self.id(), unit, self.entry_extension(), cmd, workspace, cancel)
    }

    fn restore(&self, unit: &str, dump: &Path, cancel: &Cancellation) -> Result<(), SourceError> {
        let mut create = self.command("mysql");
        create
            .arg("-e")
            .arg(format!("CREATE DATABASE IF NOT EXISTS `{}`", unit.replace('`', "``")));
        process::run(create, cancel).map_err(|err| restore_error(self.id(), unit, err))?;

        let mut import = self.command("mysql");
        import.arg(unit);
        import_from_file(self.id(), unit, import, dump, cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::testing::{log_call, read_calls, write_tool};

    fn source(tools: &Path) -> MySqlSource {
        let mut database = Database::new();
        database.id = String::from("main");
        database.credential.username = String::from("backup");
        database.credential.password = String::from("secret");
        database.host = Some(String::from("db.internal"));
        database.port = Some(3307);
        database.tool_directory = Some(tools.to_path_buf());
        MySqlSource::new(&database)
    }

    #[test]
    fn test_enumerate_skips_system_schemas() {
        let tools = TempDir::new().unwrap();
        write_tool(
            tools.path(),
            "mysql",
            &format!(
                "{}\nprintf 'information_schema\\nshop\\nperformance_schema\\ncrm\\n'",
                log_call("MYSQL_PWD")
            ),
        );

        let units = source(tools.path()).enumerate(&Cancellation::new()).unwrap();
        assert_eq!(units, vec!["shop", "crm"]);
        assert_eq!(
            read_calls(tools.path()),
            "mysql -u backup --host=db.internal --port=3307 -N -B -e SHOW DATABASES MYSQL_PWD=secret\n"
        );
    }

    #[test]
    fn test_dump_writes_sql_entry() {
        let tools = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        write_tool(tools.path(), "mysqldump", "echo \"-- $*\"\necho \"-- MYSQL_PWD=$MYSQL_PWD\"");

        let dumped = source(tools.path())
            .dump("shop", workspace.path(), &Cancellation::new())
            .unwrap();

        assert_eq!(dumped.entry_name, "shop.sql");
        assert_eq!(
            fs::read_to_string(workspace.path().join("shop.sql")).unwrap(),
            "-- -u backup --host=db.internal --port=3307 --single-transaction --routines --events --databases shop\n\
             -- MYSQL_PWD=secret\n"
        );
    }

    #[test]
    fn test_restore_creates_database_then_imports() {
        let tools = TempDir::new().unwrap();
        let dumps = TempDir::new().unwrap();
        write_tool(
            tools.path(),
            "mysql",
            &format!(
                "{}\ncat >> \"$(dirname \"$0\")/calls.log\"",
                log_call("MYSQL_PWD")
            ),
        );
        let dump = dumps.path().join("shop.sql");
        fs::write(&dump, "CREATE TABLE orders (id INT);\n").unwrap();

        source(tools.path())
            .restore("shop", &dump, &Cancellation::new())
            .unwrap();

        let calls = read_calls(tools.path());
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(
            lines,
            vec![
                "mysql -u backup --host=db.internal --port=3307 -e CREATE DATABASE IF NOT EXISTS `shop` MYSQL_PWD=secret",
                "mysql -u backup --host=db.internal --port=3307 shop MYSQL_PWD=secret",
                "CREATE TABLE orders (id INT);",
            ]
        );
    }

    #[test]
    fn test_missing_tool_is_enumerate_error() {
        let tools = TempDir::new().unwrap();
        let err = source(tools.path())
            .enumerate(&Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, SourceError::Enumerate { source_id, .. } if source_id == "main"));
    }
}
