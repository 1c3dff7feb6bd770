// sqlx::Error -> AppError translation

use transit_core::error::AppError;

/// Convert a sqlx error into an AppError, keeping SQLite result codes
///
/// Codes: https://www.sqlite.org/rescode.html
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let Some(code) = db_err.code() else {
                return AppError::Database(format!("Database error: {}", db_err.message()));
            };
            let code_str = code.as_ref();

            match code_str {
                // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
                "2067" | "1555" => AppError::Conflict(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code_str
                )),
                "787" | "3850" => AppError::Database(format!(
                    "Foreign key constraint violation: {} ({})",
                    db_err.message(),
                    code_str
                )),
                "275" => AppError::Validation(format!(
                    "Check constraint violation: {}",
                    db_err.message()
                )),
                "5" => AppError::Database(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                _ => AppError::Database(format!(
                    "Database error [{}]: {}",
                    code_str,
                    db_err.message()
                )),
            }
        }
        sqlx::Error::RowNotFound => AppError::NotFound("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            AppError::Database(format!("Cannot decode column {}: {}", index, source))
        }
        _ => AppError::Database(err.to_string()),
    }
}

/// Column values that do not map back onto the domain
pub(crate) fn corrupt_row(table: &str, id: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Database(format!("Corrupt {} row {}: {}", table, id, detail))
}
