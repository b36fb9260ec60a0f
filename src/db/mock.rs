//! Scripted in-memory pool.
//!
//! Understands the gateway's fixed statement shapes (name resolution,
//! describe, CGI init, page fetch, download probe, document insert) and
//! replies from a per-test script. Also serves as the demo backend the
//! server binary falls back to when no native driver is wired in, the
//! same way the store seeds a demo dataset on first run.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BindSet, BindValue, DbError, ExecOutcome, Pool, Session};

#[derive(Default)]
struct MockState {
    resolutions: HashMap<String, String>,
    signatures: HashMap<String, Vec<(String, String)>>,
    pages: VecDeque<Vec<String>>,
    rewind_pages: Option<Vec<Vec<String>>>,
    download: Option<(String, i64, Bytes)>,
    validation_result: Option<bool>,
    alias_target: Option<String>,
    fail_matching: Vec<(String, DbError)>,
    acquire_error: Option<DbError>,

    executed: Vec<String>,
    doc_inserts: Vec<(String, String, i64)>,
    cgi_inits: usize,
    resolve_calls: usize,
    describe_calls: usize,
    commits: usize,
    rollbacks: usize,
    released: usize,
}

/// Scripted pool handle. Cloning shares the same state so a test can keep a
/// handle for assertions while the pipeline owns another.
#[derive(Clone, Default)]
pub struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    pub fn new() -> Self {
        MockDb::default()
    }

    /// Demo backend: one sample procedure with a fixed signature and a
    /// greeting page, replayed on every acquire.
    pub fn demo() -> Self {
        let db = MockDb::new()
            .resolve("sample.pageindex", "web_demo.sample.pageindex")
            .signature("web_demo.sample.pageindex", &[("name", "VARCHAR2")])
            .page_text("Content-type: text/html\n\n<html><body><h1>plsgate demo</h1><p>procedure output served through the gateway</p></body></html>");
        {
            let mut st = db.state.lock();
            st.rewind_pages = Some(st.pages.iter().cloned().collect());
        }
        db
    }

    pub fn resolve(self, raw: &str, canonical: &str) -> Self {
        self.state.lock().resolutions.insert(raw.to_ascii_lowercase(), canonical.to_string());
        self
    }

    pub fn signature(self, canonical: &str, args: &[(&str, &str)]) -> Self {
        let sig = args.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect();
        self.state.lock().signatures.insert(canonical.to_string(), sig);
        self
    }

    /// Queue page output from plain text; lines are chunked to at most
    /// 1000 rows per fetch, matching the paging window.
    pub fn page_text(self, text: &str) -> Self {
        let lines: Vec<String> = text.split('\n').map(|s| s.to_string()).collect();
        {
            let mut st = self.state.lock();
            for chunk in lines.chunks(1000) {
                st.pages.push_back(chunk.to_vec());
            }
        }
        self
    }

    /// Queue explicit fetch chunks, e.g. [1000, 1000, 400] rows.
    pub fn page_chunks(self, chunks: Vec<Vec<String>>) -> Self {
        self.state.lock().pages.extend(chunks);
        self
    }

    pub fn download(self, file_type: &str, size: i64, blob: Bytes) -> Self {
        self.state.lock().download = Some((file_type.to_string(), size, blob));
        self
    }

    pub fn validation(self, allow: bool) -> Self {
        self.state.lock().validation_result = Some(allow);
        self
    }

    pub fn alias_target(self, target: &str) -> Self {
        self.state.lock().alias_target = Some(target.to_string());
        self
    }

    /// Fail any execute whose statement contains `needle`.
    pub fn fail_when(self, needle: &str, err: DbError) -> Self {
        self.state.lock().fail_matching.push((needle.to_string(), err));
        self
    }

    pub fn acquire_fail(self, err: DbError) -> Self {
        self.state.lock().acquire_error = Some(err);
        self
    }

    // --- assertion accessors ---

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn executed_matching(&self, needle: &str) -> usize {
        self.state.lock().executed.iter().filter(|s| s.contains(needle)).count()
    }

    pub fn doc_inserts(&self) -> Vec<(String, String, i64)> {
        self.state.lock().doc_inserts.clone()
    }

    pub fn cgi_inits(&self) -> usize {
        self.state.lock().cgi_inits
    }

    pub fn resolve_calls(&self) -> usize {
        self.state.lock().resolve_calls
    }

    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }
}

#[async_trait]
impl Pool for MockDb {
    async fn acquire(&self) -> Result<Box<dyn Session>, DbError> {
        let mut st = self.state.lock();
        if let Some(err) = st.acquire_error.clone() {
            return Err(err);
        }
        if let Some(rewind) = st.rewind_pages.clone() {
            st.pages = rewind.into_iter().collect();
        }
        Ok(Box::new(MockSession { state: self.state.clone() }))
    }
}

struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn reply(st: &mut MockState, statement: &str, binds: &BindSet) -> Result<ExecOutcome, DbError> {
        let mut outcome = ExecOutcome::default();

        if statement.contains("dbms_utility.name_resolve") {
            st.resolve_calls += 1;
            let raw = binds
                .get("name")
                .and_then(|b| b.value.as_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            let canonical = st.resolutions.get(&raw).cloned().ok_or(DbError::Execution {
                code: 6564,
                message: format!("ORA-06564: object {} does not exist", raw),
            })?;
            let mut parts = canonical.split('.');
            let schema = parts.next().unwrap_or("").to_string();
            let part1 = parts.next().unwrap_or("").to_string();
            let part2 = parts.next().unwrap_or("").to_string();
            outcome.out_binds.insert("schema".into(), BindValue::Str(schema));
            outcome.out_binds.insert("part1".into(), BindValue::Str(part1));
            outcome.out_binds.insert("part2".into(), BindValue::Str(part2));
            return Ok(outcome);
        }

        if statement.contains("dbms_describe.describe_procedure") {
            st.describe_calls += 1;
            let object = binds.get("object_name").and_then(|b| b.value.as_str()).unwrap_or("");
            let sig = st.signatures.get(object).cloned().unwrap_or_default();
            let names: Vec<String> = sig.iter().map(|(n, _)| n.clone()).collect();
            let types: Vec<String> = sig.iter().map(|(_, t)| t.clone()).collect();
            outcome.out_binds.insert("argument_name".into(), BindValue::StrArray(names));
            outcome.out_binds.insert("datatype".into(), BindValue::StrArray(types));
            return Ok(outcome);
        }

        if statement.contains("owa.init_cgi_env") {
            st.cgi_inits += 1;
            return Ok(outcome);
        }

        if statement.contains("owa.get_page") {
            let chunk = st.pages.pop_front().unwrap_or_default();
            outcome.out_binds.insert("irows".into(), BindValue::Int(chunk.len() as i64));
            outcome.out_binds.insert("lines".into(), BindValue::StrArray(chunk));
            return Ok(outcome);
        }

        if statement.contains("wpg_docload.get_download_file") {
            match st.download.clone() {
                Some((ftype, size, blob)) => {
                    outcome.out_binds.insert("file_type".into(), BindValue::Str(ftype));
                    outcome.out_binds.insert("file_size".into(), BindValue::Int(size));
                    outcome.out_binds.insert("file_blob".into(), BindValue::Raw(blob));
                }
                None => {
                    outcome.out_binds.insert("file_type".into(), BindValue::Str(String::new()));
                }
            }
            return Ok(outcome);
        }

        if statement.starts_with("insert into") {
            let name = binds.get("name").and_then(|b| b.value.as_str()).unwrap_or("").to_string();
            let mime = binds.get("mime_type").and_then(|b| b.value.as_str()).unwrap_or("").to_string();
            let size = binds.get("doc_size").and_then(|b| b.value.as_int()).unwrap_or(0);
            st.doc_inserts.push((name, mime, size));
            return Ok(outcome);
        }

        if statement.contains(":result := case") {
            let allow = st.validation_result.unwrap_or(true);
            outcome.out_binds.insert("result".into(), BindValue::Int(if allow { 1 } else { 0 }));
            return Ok(outcome);
        }

        if statement.contains(":target :=") {
            let target = st.alias_target.clone().ok_or(DbError::Execution {
                code: 6550,
                message: "ORA-06550: alias resolver not available".into(),
            })?;
            outcome.out_binds.insert("target".into(), BindValue::Str(target));
            return Ok(outcome);
        }

        // Anything else is the procedure invocation itself.
        Ok(outcome)
    }
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&mut self, statement: &str, binds: &BindSet) -> Result<ExecOutcome, DbError> {
        let mut st = self.state.lock();
        st.executed.push(statement.to_string());
        if let Some((_, err)) = st.fail_matching.iter().find(|(needle, _)| statement.contains(needle)) {
            return Err(err.clone());
        }
        Self::reply(&mut st, statement, binds)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.state.lock().commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.state.lock().released += 1;
    }
}
