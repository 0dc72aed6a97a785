use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use crate::configuration::Database;
use crate::error::SourceError;
use crate::helper::process::{self, Cancellation};

use super::{dump_to_file, list_units, restore_error, DumpedUnit, SourceAdapter};

const LIST_DATABASES: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn ORDER BY datname";

pub struct PostgreSqlSource {
    database: Database,
}

impl PostgreSqlSource {
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
            if !credential.password.is_empty() {
                cmd.env("PGPASSWORD", &credential.password);
            }
        }
        cmd.arg(format!(
            "--host={}",
            self.database.host.as_deref().unwrap_or("localhost")
        ));
        if let Some(port) = self.database.port {
            cmd.arg(format!("--port={}", port));
        }
        cmd
    }
}

impl SourceAdapter for PostgreSqlSource {
    fn id(&self) -> &str {
        &self.database.id
    }

    fn entry_extension(&self) -> &str {
        ".sql"
    }

    fn enumerate(&self, cancel: &Cancellation) -> Result<Vec<String>, SourceError> {
        let mut cmd = self.command("psql");
        cmd.arg("--dbname=postgres")
            .arg("--no-align")
            .arg("--tuples-only")
            .arg(format!("--command={}", LIST_DATABASES));

        list_units(self.id(), cmd, cancel)
    }

    fn dump(
        &self,
        unit: &str,
        workspace: &Path,
        cancel: &Cancellation,
    ) -> Result<DumpedUnit, SourceError> {
        let mut cmd = self.command("pg_dump");
        cmd.arg(format!("--dbname={}", unit));

        dump_to_file(self.id(), unit, self.entry_extension(), cmd, workspace, cancel)
    }

    /// Replays the dump into the existing database `unit`.
    fn restore(&self, unit: &str, dump: &Path, cancel: &Cancellation) -> Result<(), SourceError> {
        let mut cmd = self.command("psql");
        cmd.arg(format!("--dbname={}", unit))
            .arg("--set=ON_ERROR_STOP=1")
            .arg("--file")
            .arg(dump);

        process::run(cmd, cancel).map_err(|err| restore_error(self.id(), unit, err))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::configuration::DatabaseKind;
    use crate::testing::{log_call, read_calls, write_tool};

    fn source(tools: &Path) -> PostgreSqlSource {
        let mut database = Database::new();
        database.id = String::from("pg");
        database.kind = DatabaseKind::PostgreSql;
        database.credential.username = String::from("backup");
        database.credential.password = String::from("secret");
        database.tool_directory = Some(tools.to_path_buf());
        PostgreSqlSource::new(&database)
    }

    #[test]
    fn test_enumerate_lists_connectable_databases() {
        let tools = TempDir::new().unwrap();
        write_tool(
            tools.path(),
            "psql",
            &format!("{}\nprintf 'postgres\\n\\nshop\\n'", log_call("PGPASSWORD")),
        );

        let units = source(tools.path()).enumerate(&Cancellation::new()).unwrap();
        assert_eq!(units, vec!["postgres", "shop"]);

        let calls = read_calls(tools.path());
        assert!(calls.starts_with(
            "psql --username=backup --host=localhost --dbname=postgres --no-align --tuples-only --command=SELECT datname"
        ));
        assert!(calls.ends_with("PGPASSWORD=secret\n"));
    }

    #[test]
    fn test_dump_writes_sql_entry() {
        let tools = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        write_tool(tools.path(), "pg_dump", "echo \"-- $* PGPASSWORD=$PGPASSWORD\"");

        let dumped = source(tools.path())
            .dump("shop", workspace.path(), &Cancellation::new())
            .unwrap();

        assert_eq!(dumped.entry_name, "shop.sql");
        assert_eq!(
            fs::read_to_string(workspace.path().join("shop.sql")).unwrap(),
            "-- --username=backup --host=localhost --dbname=shop PGPASSWORD=secret\n"
        );
    }

    #[test]
    fn test_restore_replays_dump_file() {
        let tools = TempDir::new().unwrap();
        let dumps = TempDir::new().unwrap();
        write_tool(tools.path(), "psql", &log_call("PGPASSWORD"));
        let dump = dumps.path().join("shop.sql");
        fs::write(&dump, "SELECT 1;\n").unwrap();

        source(tools.path())
            .restore("shop", &dump, &Cancellation::new())
            .unwrap();

        assert_eq!(
            read_calls(tools.path()),
            format!(
                "psql --username=backup --host=localhost --dbname=shop --set=ON_ERROR_STOP=1 --file {} PGPASSWORD=secret\n",
                dump.display()
            )
        );
    }

    #[test]
    fn test_failed_restore_is_source_error() {
        let tools = TempDir::new().unwrap();
        write_tool(tools.path(), "psql", "echo 'database \"shop\" does not exist' >&2\nexit 2");

        let err = source(tools.path())
            .restore("shop", Path::new("/nonexistent/shop.sql"), &Cancellation::new())
            .unwrap_err();
        match err {
            SourceError::Restore { unit, reason, .. } => {
                assert_eq!(unit, "shop");
                assert!(reason.contains("does not exist"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
