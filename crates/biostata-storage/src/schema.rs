use rusqlite::Connection;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    // Meta tables start with an underscore, which user table names may not.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _tables (
          name TEXT PRIMARY KEY,
          position INTEGER NOT NULL,
          comment TEXT NOT NULL DEFAULT '',
          state JSON
        );

        -- One column-info record per column, in display order.
        CREATE TABLE IF NOT EXISTS _columns (
          table_name TEXT NOT NULL,
          position INTEGER NOT NULL,
          name TEXT NOT NULL,
          type TEXT NOT NULL,
          dict TEXT,
          dim TEXT NOT NULL DEFAULT '',
          shortname TEXT NOT NULL DEFAULT '',
          comment TEXT NOT NULL DEFAULT '',
          is_original INTEGER NOT NULL,
          state JSON NOT NULL,
          PRIMARY KEY (table_name, name)
        );

        CREATE INDEX IF NOT EXISTS idx_columns_table ON _columns(table_name, position);

        CREATE TABLE IF NOT EXISTS _dictionaries (
          name TEXT PRIMARY KEY,
          type TEXT NOT NULL,
          keys JSON NOT NULL,
          vals JSON NOT NULL,
          comments JSON NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _filters (
          name TEXT PRIMARY KEY,
          definition JSON NOT NULL
        );
        "#,
    )
}

/// Whether a table (of any kind) named `name` exists, compared case-insensitively.
pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE lower(name) = lower(?1)",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// First of `base`, `base_1`, `base_2`, ... that is not taken in `sqlite_master`.
pub(crate) fn free_table_name(conn: &Connection, base: &str) -> rusqlite::Result<String> {
    if !table_exists(conn, base)? {
        return Ok(base.to_string());
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}_{n}");
        if !table_exists(conn, &candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Drop every leftover staging (and rebuild scratch) table.
pub(crate) fn drop_staging_tables(conn: &Connection) -> rusqlite::Result<()> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            r"SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '\_staging\_%' ESCAPE '\'",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for name in names {
        log::debug!("dropping leftover staging table {name}");
        conn.execute(&format!("DROP TABLE {}", biostata_model::quote_ident(&name)), [])?;
    }
    Ok(())
}
