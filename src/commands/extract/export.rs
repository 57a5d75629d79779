use super::*;

// Row identity columns written ahead of the flat record columns.
const ROW_KEY_COLUMNS: &[&str] = &[
    "run_id",
    "filename",
    "row_index",
    "page",
    "grammar",
    "template_id",
];

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

pub fn table_exists(connection: &Connection, table: &str) -> Result<bool> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn parameter_rows_ddl() -> String {
    let mut columns = vec![
        "run_id TEXT NOT NULL".to_string(),
        "filename TEXT NOT NULL".to_string(),
        "row_index INTEGER NOT NULL".to_string(),
        "page INTEGER NOT NULL".to_string(),
        "grammar TEXT NOT NULL".to_string(),
        "template_id TEXT NOT NULL".to_string(),
        "code TEXT NOT NULL".to_string(),
        "description TEXT".to_string(),
        "raw_value TEXT".to_string(),
    ];
    columns.extend((1..=TOKEN_COLUMNS).map(|index| format!("token_{index} TEXT")));
    columns.extend((1..=CHECKBOX_COLUMNS).map(|index| format!("checkbox_{index} TEXT")));
    columns.push("overall_confidence REAL NOT NULL".to_string());
    columns.push("checked_count INTEGER NOT NULL".to_string());
    columns.push("record_json TEXT NOT NULL".to_string());
    columns.push("PRIMARY KEY(run_id, filename, row_index)".to_string());

    format!(
        "CREATE TABLE IF NOT EXISTS parameter_rows (\n  {}\n)",
        columns.join(",\n  ")
    )
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
          run_id TEXT NOT NULL,
          filename TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          grammar TEXT,
          template_id TEXT,
          status TEXT NOT NULL,
          pages_processed INTEGER NOT NULL,
          record_count INTEGER NOT NULL,
          issue_count INTEGER NOT NULL,
          elapsed_ms INTEGER NOT NULL,
          staged_at TEXT NOT NULL,
          PRIMARY KEY(run_id, filename)
        );

        CREATE TABLE IF NOT EXISTS checkbox_diagnostics (
          run_id TEXT NOT NULL,
          filename TEXT NOT NULL,
          page INTEGER NOT NULL,
          region_id TEXT NOT NULL,
          x INTEGER NOT NULL,
          y INTEGER NOT NULL,
          width INTEGER NOT NULL,
          height INTEGER NOT NULL,
          state TEXT NOT NULL,
          interior_ink_density REAL NOT NULL,
          PRIMARY KEY(run_id, filename, region_id)
        );

        CREATE TABLE IF NOT EXISTS document_issues (
          run_id TEXT NOT NULL,
          filename TEXT NOT NULL,
          ordinal INTEGER NOT NULL,
          kind TEXT NOT NULL,
          recoverable INTEGER NOT NULL,
          message TEXT NOT NULL,
          detail_json TEXT NOT NULL,
          PRIMARY KEY(run_id, filename, ordinal)
        );
        ",
    )?;

    connection
        .execute_batch(&parameter_rows_ddl())
        .context("failed to create parameter_rows table")?;

    connection.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_parameter_rows_code ON parameter_rows(run_id, code);
        CREATE INDEX IF NOT EXISTS idx_document_issues_kind ON document_issues(run_id, kind);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('schema_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![now],
    )?;

    Ok(())
}

pub(crate) struct StagingStore {
    connection: Connection,
    insert_row_sql: String,
}

impl StagingStore {
    pub(crate) fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        let mut columns = ROW_KEY_COLUMNS
            .iter()
            .map(|column| column.to_string())
            .collect::<Vec<String>>();
        columns.extend(flat_row_header());
        columns.push("checked_count".to_string());
        columns.push("record_json".to_string());
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<String>>();
        let insert_row_sql = format!(
            "INSERT INTO parameter_rows({}) VALUES({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        Ok(Self {
            connection,
            insert_row_sql,
        })
    }

    /// Replaces everything staged for this document in this run, in one
    /// transaction. Returns the number of parameter rows written.
    pub(crate) fn stage_document(
        &mut self,
        run_id: &str,
        outcome: &DocumentOutcome,
    ) -> Result<usize> {
        let tx = self
            .connection
            .transaction()
            .context("failed to begin staging transaction")?;

        for table in [
            "documents",
            "parameter_rows",
            "checkbox_diagnostics",
            "document_issues",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE run_id = ?1 AND filename = ?2"),
                params![run_id, outcome.filename],
            )
            .with_context(|| format!("failed to clear {table} for {}", outcome.filename))?;
        }

        tx.execute(
            "INSERT INTO documents(
               run_id, filename, sha256, grammar, template_id, status,
               pages_processed, record_count, issue_count, elapsed_ms, staged_at
             ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                outcome.filename,
                outcome.sha256,
                outcome.grammar.map(|grammar| grammar.as_str()),
                outcome.template_id,
                outcome.status.as_str(),
                outcome.pages_processed as i64,
                outcome.records.len() as i64,
                outcome.issues.len() as i64,
                outcome.elapsed_ms as i64,
                now_utc_string(),
            ],
        )
        .with_context(|| format!("failed to stage document {}", outcome.filename))?;

        {
            let mut insert_row = tx
                .prepare(&self.insert_row_sql)
                .context("failed to prepare parameter row insert")?;
            for (row_index, record) in outcome.records.iter().enumerate() {
                let values = row_values(run_id, &outcome.filename, row_index, record)?;
                insert_row
                    .execute(params_from_iter(values))
                    .with_context(|| {
                        format!("failed to stage {} row {row_index}", outcome.filename)
                    })?;
            }

            let mut insert_diagnostic = tx.prepare(
                "INSERT INTO checkbox_diagnostics(
                   run_id, filename, page, region_id, x, y, width, height, state,
                   interior_ink_density
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for diagnostic in &outcome.diagnostics {
                insert_diagnostic.execute(params![
                    run_id,
                    outcome.filename,
                    diagnostic.page,
                    diagnostic.region_id,
                    diagnostic.x,
                    diagnostic.y,
                    diagnostic.width,
                    diagnostic.height,
                    diagnostic.state.as_str(),
                    diagnostic.interior_ink_density,
                ])?;
            }

            let mut insert_issue = tx.prepare(
                "INSERT INTO document_issues(
                   run_id, filename, ordinal, kind, recoverable, message, detail_json
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (ordinal, issue) in outcome.issues.iter().enumerate() {
                let detail = serde_json::to_string(issue).context("failed to serialize issue")?;
                insert_issue.execute(params![
                    run_id,
                    outcome.filename,
                    ordinal as i64,
                    issue.kind(),
                    issue.is_recoverable(),
                    issue.to_string(),
                    detail,
                ])?;
            }
        }

        tx.commit()
            .with_context(|| format!("failed to commit staging for {}", outcome.filename))?;
        Ok(outcome.records.len())
    }

    pub(crate) fn staged_row_count(&self, run_id: &str) -> Result<i64> {
        let count = self.connection.query_row(
            "SELECT COUNT(*) FROM parameter_rows WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }
}

fn row_values(
    run_id: &str,
    filename: &str,
    row_index: usize,
    record: &ParameterRecord,
) -> Result<Vec<Value>> {
    let row = flatten_record(record);
    let text = |value: &Option<String>| match value {
        Some(value) => Value::Text(value.clone()),
        None => Value::Null,
    };

    let mut values = vec![
        Value::Text(run_id.to_string()),
        Value::Text(filename.to_string()),
        Value::Integer(row_index as i64),
        Value::Integer(i64::from(record.page)),
        Value::Text(record.grammar.as_str().to_string()),
        Value::Text(record.template_id.clone()),
        Value::Text(row.code),
        Value::Text(row.description),
        Value::Text(row.raw_value),
    ];
    values.extend(row.token_columns.iter().map(text));
    values.extend(row.checkbox_columns.iter().map(text));
    values.push(Value::Real(row.overall_confidence));
    values.push(Value::Integer(record.checked_count() as i64));
    values.push(Value::Text(
        serde_json::to_string(record).context("failed to serialize parameter record")?,
    ));
    Ok(values)
}
