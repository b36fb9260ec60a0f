//! Document upload and download bridge.
//!
//! Uploaded multipart files land in the route's document table before the
//! procedure runs, so the procedure can reference them by name. Downloads
//! are probed after invocation: a non-empty file type from the dedicated
//! download call short-circuits page assembly and the blob becomes the
//! whole response body.

use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::db::{BindSet, BindSpec, BindValue, DbError, Session};
use crate::error::{GatewayError, GatewayResult, ProcedureFailure};
use crate::page::FilePayload;
use crate::resolve::is_safe_ident;

const DOWNLOAD_PROBE_SQL: &str =
    "begin wpg_docload.get_download_file(:file_type, :file_size, :file_blob); end;";

/// One decoded multipart file part, already staged to a temp path by the
/// HTTP layer. Consumed (and its temp file removed) within the request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: String,
    pub encoding: String,
    pub mime_type: String,
    pub temp_path: PathBuf,
    pub size: u64,
}

/// Stream every uploaded file into the document table. Runs before
/// procedure invocation; any failure aborts the pipeline.
pub async fn store_uploads(
    session: &mut dyn Session,
    document_table: Option<&str>,
    files: &[UploadedFile],
) -> GatewayResult<()> {
    if files.is_empty() {
        return Ok(());
    }
    let table = match document_table {
        Some(t) if is_safe_ident(t) => t,
        Some(t) => {
            return Err(GatewayError::Internal(format!("invalid document table name: '{}'", t)))
        }
        None => {
            return Err(GatewayError::BadRequest(
                "file upload received but the route configures no document table".into(),
            ))
        }
    };
    let statement = format!(
        "insert into {} (name, mime_type, doc_size, content_type, last_updated, blob_content) \
         values (:name, :mime_type, :doc_size, 'BLOB', sysdate, :blob_content)",
        table
    );
    for file in files {
        let content = tokio::fs::read(&file.temp_path).await.map_err(|e| {
            GatewayError::Document(format!(
                "failed to read staged upload '{}': {}",
                file.temp_path.display(),
                e
            ))
        })?;
        let mut binds = BindSet::new();
        binds.push("name", BindSpec::input(BindValue::Str(file.original_name.clone())));
        binds.push("mime_type", BindSpec::input(BindValue::Str(file.mime_type.clone())));
        binds.push("doc_size", BindSpec::input(BindValue::Int(content.len() as i64)));
        binds.push("blob_content", BindSpec::input(BindValue::Raw(Bytes::from(content))));
        if let Err(e) = session.execute(&statement, &binds).await {
            return Err(match e {
                DbError::Execution { .. } => {
                    GatewayError::Procedure(ProcedureFailure::new(statement.clone(), binds, &e))
                }
                other => GatewayError::Pool(other),
            });
        }
        debug!(name = %file.original_name, size = file.size, "stored uploaded document");
        if let Err(e) = tokio::fs::remove_file(&file.temp_path).await {
            warn!(path = %file.temp_path.display(), error = %e, "failed to remove staged upload");
        }
    }
    Ok(())
}

/// Ask the session whether the invocation produced a file download.
/// `None` means the procedure rendered a page instead.
pub async fn download_probe(session: &mut dyn Session) -> GatewayResult<Option<FilePayload>> {
    let mut binds = BindSet::new();
    binds.push("file_type", BindSpec::output());
    binds.push("file_size", BindSpec::output());
    binds.push("file_blob", BindSpec::output());
    let outcome = match session.execute(DOWNLOAD_PROBE_SQL, &binds).await {
        Ok(o) => o,
        Err(e @ DbError::Execution { .. }) => {
            return Err(GatewayError::Procedure(ProcedureFailure::new(DOWNLOAD_PROBE_SQL, binds, &e)))
        }
        Err(other) => return Err(GatewayError::Pool(other)),
    };
    let file_type = outcome.out_str("file_type").unwrap_or("");
    if file_type.is_empty() {
        return Ok(None);
    }
    let blob = outcome.out_raw("file_blob").cloned().unwrap_or_else(Bytes::new);
    let size = outcome.out_int("file_size").unwrap_or(blob.len() as i64);
    Ok(Some(FilePayload { file_type: file_type.to_string(), size, blob }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDb;
    use crate::db::Pool;
    use std::io::Write;

    fn staged_file(contents: &[u8]) -> (tempfile::TempDir, UploadedFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        let file = UploadedFile {
            field_name: "attachment".into(),
            original_name: "report.pdf".into(),
            encoding: "binary".into(),
            mime_type: "application/pdf".into(),
            temp_path: path,
            size: contents.len() as u64,
        };
        (dir, file)
    }

    #[tokio::test]
    async fn upload_inserts_row_and_removes_temp_file() {
        let db = MockDb::new();
        let mut session = db.acquire().await.unwrap();
        let (_dir, file) = staged_file(b"pdf bytes");
        let path = file.temp_path.clone();

        store_uploads(session.as_mut(), Some("app_docs"), &[file]).await.unwrap();

        let inserts = db.doc_inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].0, "report.pdf");
        assert_eq!(inserts[0].1, "application/pdf");
        assert_eq!(inserts[0].2, 9);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn upload_without_document_table_is_rejected() {
        let db = MockDb::new();
        let mut session = db.acquire().await.unwrap();
        let (_dir, file) = staged_file(b"x");
        let err = store_uploads(session.as_mut(), None, &[file]).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(db.doc_inserts().is_empty());
    }

    #[tokio::test]
    async fn probe_reports_no_download_for_rendered_pages() {
        let db = MockDb::new();
        let mut session = db.acquire().await.unwrap();
        assert!(download_probe(session.as_mut()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn probe_returns_payload_when_procedure_signalled_download() {
        let db = MockDb::new().download("application/pdf", 3, Bytes::from_static(b"pdf"));
        let mut session = db.acquire().await.unwrap();
        let file = download_probe(session.as_mut()).await.unwrap().unwrap();
        assert_eq!(file.file_type, "application/pdf");
        assert_eq!(file.size, 3);
        assert_eq!(file.blob, Bytes::from_static(b"pdf"));
    }
}
