use super::*;

/// One staged parameter row, rebuilt from its `record_json` column.
#[derive(Debug, Clone)]
pub(crate) struct StagedRow {
    pub(crate) filename: String,
    pub(crate) row_index: i64,
    pub(crate) record: ParameterRecord,
}

/// The requested run when it exists, otherwise the newest staged run.
pub(crate) fn resolve_run_id(connection: &Connection, requested: Option<&str>) -> Result<String> {
    if let Some(run_id) = requested {
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM documents WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        if count == 0 {
            bail!("run {run_id} has no staged documents");
        }
        return Ok(run_id.to_string());
    }

    // Run ids embed a compact UTC timestamp, so lexical order is run order.
    let latest: Option<String> =
        connection.query_row("SELECT MAX(run_id) FROM documents", [], |row| row.get(0))?;
    latest.context("staging store has no runs; run extract first")
}

pub(crate) fn load_staged_rows(
    connection: &Connection,
    run_id: &str,
    filename: Option<&str>,
    grammar: Option<&str>,
) -> Result<Vec<StagedRow>> {
    let mut statement = connection.prepare(
        "
        SELECT filename, row_index, record_json
        FROM parameter_rows
        WHERE run_id = ?1
          AND (?2 IS NULL OR filename = ?2)
          AND (?3 IS NULL OR grammar = ?3)
        ORDER BY filename ASC, row_index ASC
        ",
    )?;

    let raw_rows = statement
        .query_map(params![run_id, filename, grammar], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<(String, i64, String)>>>()?;

    raw_rows
        .into_iter()
        .map(|(filename, row_index, record_json)| {
            let record = serde_json::from_str::<ParameterRecord>(&record_json).with_context(
                || format!("failed to parse staged record {filename} row {row_index}"),
            )?;
            Ok(StagedRow {
                filename,
                row_index,
                record,
            })
        })
        .collect()
}
