use super::{changes, Revision, Snapshot};
use benchtrail_ingest::{History, IngestError, Run, Suite};
use parking_lot::{FairMutex, FairMutexGuard};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::{debug, error, info};

// one versioned record per suite, runs keyed by their slot inside the suite
pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists meta (
    key text primary key,
    value text not null
);",
    "create table if not exists suites (
    name text primary key,
    position integer not null,
    version integer not null
);",
    "create table if not exists runs (
    suite text not null references suites (name),
    date integer not null,
    ordinal integer not null,
    payload text not null,
    primary key (suite, date, ordinal)
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

fn sql_error(error: rusqlite::Error) -> IngestError {
    IngestError::persist(format!("SQLite: {error}"))
}

#[derive(Debug)]
pub struct SQLiteStore {
    connection: FairMutex<Connection>,
    timeout: Duration,
}

impl SQLiteStore {
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, IngestError> {
        let connection = Connection::open(path).map_err(sql_error)?;
        connection.busy_timeout(timeout).map_err(sql_error)?;

        for (counter, table) in SQL_SCHEMA.iter().enumerate().map(|(i, t)| (i + 1, t)) {
            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(sql_error(error));
                }
            };
        }

        Ok(Self {
            connection: FairMutex::new(connection),
            timeout,
        })
    }

    fn lock(&self) -> Result<FairMutexGuard<'_, Connection>, IngestError> {
        self.connection.try_lock_for(self.timeout).ok_or_else(|| {
            IngestError::persist(format!(
                "timed out after {:?} waiting for the SQLite connection",
                self.timeout
            ))
        })
    }

    pub fn load(&self) -> Result<Snapshot, IngestError> {
        let connection = self.lock()?;
        let transaction = connection.unchecked_transaction().map_err(sql_error)?;

        let repo_url: Option<String> = transaction
            .query_row("select value from meta where key = 'repo_url'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sql_error)?;

        let records = transaction
            .prepare_cached("select name, version from suites order by position")
            .map_err(sql_error)?
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_error)?;

        let mut suites = Vec::with_capacity(records.len());
        let mut versions = BTreeMap::new();

        {
            let mut statement = transaction
                .prepare_cached("select payload from runs where suite = ? order by date, ordinal")
                .map_err(sql_error)?;

            for (name, version) in records {
                let runs = statement
                    .query_map(params![name], |row| row.get::<_, String>(0))
                    .map_err(sql_error)?
                    .map(|payload| {
                        let payload = payload.map_err(sql_error)?;

                        serde_json::from_str::<Run>(&payload).map_err(|error| {
                            IngestError::corrupt(format!("run of suite {name}: {error}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                suites.push(Suite::from_runs(name.clone(), runs));
                versions.insert(name, version);
            }
        }

        let history = History::from_suites(repo_url.unwrap_or_default(), suites)?;

        debug!(
            suites = history.suites().len(),
            runs = history.run_count(),
            "Loaded history"
        );

        Ok(Snapshot {
            history,
            revision: Revision::Versions(versions),
        })
    }

    /// Write only the touched suites, each guarded by its own version.
    pub fn commit(&self, snapshot: &Snapshot, history: &History) -> Result<Revision, IngestError> {
        let changes = changes(&snapshot.history, history)?;

        let Revision::Versions(versions) = &snapshot.revision else {
            return Err(IngestError::persist(
                "snapshot was not loaded from a SQLite store",
            ));
        };

        let mut connection = self.lock()?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;

        if history.repo_url() != snapshot.history.repo_url() {
            transaction
                .execute(
                    "insert into meta (key, value) values ('repo_url', ?1)
                     on conflict (key) do update set value = excluded.value",
                    params![history.repo_url()],
                )
                .map_err(sql_error)?;
        }

        let mut updated = versions.clone();
        let mut written = 0;

        for change in changes.iter() {
            let name = change.suite.name();

            let version = if change.created {
                let position: i64 = transaction
                    .query_row(
                        "select coalesce(max(position) + 1, 0) from suites",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(sql_error)?;

                let inserted = transaction
                    .execute(
                        "insert into suites (name, position, version) values (?1, ?2, 1)
                         on conflict (name) do nothing",
                        params![name, position],
                    )
                    .map_err(sql_error)?;

                if inserted == 0 {
                    debug!(suite = name, "Suite was created concurrently");

                    return Err(IngestError::StaleWrite);
                }

                1
            } else {
                let Some(expected) = versions.get(name) else {
                    return Err(IngestError::StaleWrite);
                };

                let bumped = transaction
                    .execute(
                        "update suites set version = version + 1 where name = ?1 and version = ?2",
                        params![name, expected],
                    )
                    .map_err(sql_error)?;

                if bumped == 0 {
                    debug!(suite = name, expected, "Suite version moved since load");

                    return Err(IngestError::StaleWrite);
                }

                expected + 1
            };

            let mut statement = transaction
                .prepare_cached(
                    "insert into runs (suite, date, ordinal, payload) values (?1, ?2, ?3, ?4)
                     on conflict (suite, date, ordinal) do update set payload = excluded.payload",
                )
                .map_err(sql_error)?;

            for ((date, ordinal), run) in change.writes.iter() {
                let date = i64::try_from(*date).map_err(|_| {
                    IngestError::invalid(format!("date {date} exceeds the SQLite integer range"))
                })?;
                let payload = serde_json::to_string(run).map_err(|error| {
                    IngestError::persist(format!("failed to serialize run: {error}"))
                })?;

                statement
                    .execute(params![name, date, *ordinal as i64, payload])
                    .map_err(sql_error)?;
                written += 1;
            }

            updated.insert(name.to_owned(), version);
        }

        transaction.commit().map_err(sql_error)?;

        info!(suites = changes.len(), runs = written, "Committed history");

        Ok(Revision::Versions(updated))
    }
}
