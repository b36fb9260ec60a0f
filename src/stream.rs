//! Procedure execution and paged output retrieval.
//!
//! The server side buffers everything a procedure prints; the gateway
//! pulls that buffer down in bounded fetches. A fetch returning fewer
//! rows than the window is the only termination signal. Transaction
//! finalization runs exactly once, after the stream is drained (or on
//! the error branch), and the session goes back to its pool on every
//! exit path because dropping it releases it.

use tracing::{error, warn};

use crate::bind::BindPlan;
use crate::cgi::RequestEnvironment;
use crate::config::TransactionPolicy;
use crate::db::{BindDirection, BindSet, BindSpec, BindValue, DbError, Session};
use crate::error::{GatewayError, GatewayResult, ProcedureFailure};

/// Rows per paging fetch.
pub const PAGE_FETCH_ROWS: usize = 1000;

const GET_PAGE_SQL: &str = "begin owa.get_page(:lines, :irows); end;";
const INIT_CGI_SQL: &str = "begin owa.init_cgi_env(:num_params, :param_name, :param_val); end;";

/// Push the request's CGI environment into the session. One call per
/// request; sessions are request scoped so nothing is reused.
pub async fn init_cgi(session: &mut dyn Session, env: &RequestEnvironment) -> GatewayResult<()> {
    let (names, values) = env.to_arrays();
    let bound = names.len().max(1);
    let mut binds = BindSet::new();
    binds.push("num_params", BindSpec::input(BindValue::Int(names.len() as i64)));
    binds.push("param_name", BindSpec::input(BindValue::StrArray(names)).with_bound(bound));
    binds.push("param_val", BindSpec::input(BindValue::StrArray(values)).with_bound(bound));
    session
        .execute(INIT_CGI_SQL, &binds)
        .await
        .map_err(|e| match e {
            DbError::Execution { .. } => {
                GatewayError::Procedure(ProcedureFailure::new(INIT_CGI_SQL, binds.clone(), &e))
            }
            other => GatewayError::Pool(other),
        })?;
    Ok(())
}

/// Execute the bind plan. A raised database error becomes a
/// `ProcedureFailure` carrying the statement and binds; no partial output
/// is ever streamed after that.
pub async fn invoke(session: &mut dyn Session, plan: &BindPlan) -> GatewayResult<()> {
    match session.execute(&plan.statement, &plan.binds).await {
        Ok(_) => Ok(()),
        Err(e @ DbError::Execution { .. }) => Err(GatewayError::Procedure(ProcedureFailure::new(
            plan.statement.clone(),
            plan.binds.clone(),
            &e,
        ))),
        Err(other) => Err(GatewayError::Pool(other)),
    }
}

/// Pull-based, finite, non-restartable view of the procedure's buffered
/// output. Owns the session until finalization.
pub struct PageStream {
    session: Box<dyn Session>,
    canonical: String,
    policy: TransactionPolicy,
    done: bool,
}

impl PageStream {
    pub fn new(session: Box<dyn Session>, canonical: String, policy: TransactionPolicy) -> Self {
        PageStream { session, canonical, policy, done: false }
    }

    /// Fetch the next batch of output rows. `None` once the stream is
    /// exhausted; a short fetch (fewer than `PAGE_FETCH_ROWS` rows) marks
    /// the stream done, and a zero-row first fetch is immediately terminal.
    pub async fn next_chunk(&mut self) -> GatewayResult<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let mut binds = BindSet::new();
        binds.push("lines", BindSpec::output().with_bound(PAGE_FETCH_ROWS));
        binds.push(
            "irows",
            BindSpec {
                direction: BindDirection::InOut,
                value: BindValue::Int(PAGE_FETCH_ROWS as i64),
                array_bound: None,
            },
        );
        let outcome = match self.session.execute(GET_PAGE_SQL, &binds).await {
            Ok(o) => o,
            Err(e @ DbError::Execution { .. }) => {
                self.done = true;
                return Err(GatewayError::Procedure(ProcedureFailure::new(GET_PAGE_SQL, binds, &e)));
            }
            Err(other) => {
                self.done = true;
                return Err(GatewayError::Pool(other));
            }
        };
        let fetched = outcome.out_int("irows").unwrap_or(0).max(0) as usize;
        let mut lines = outcome
            .out_binds
            .get("lines")
            .and_then(|v| v.as_str_array())
            .map(|v| v.to_vec())
            .unwrap_or_default();
        lines.truncate(fetched);
        if fetched < PAGE_FETCH_ROWS {
            self.done = true;
        }
        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(lines))
    }

    /// Success branch: apply the route's transaction policy and release
    /// the session. Runs at most once; consuming `self` enforces that.
    pub async fn finish(mut self) -> GatewayResult<()> {
        let result = match &self.policy {
            TransactionPolicy::Commit => self.session.commit().await,
            TransactionPolicy::Rollback => self.session.rollback().await,
            TransactionPolicy::Custom(cb) => {
                let cb = cb.clone();
                cb(self.session.as_mut(), &self.canonical).await
            }
        };
        result.map_err(|e| match e {
            DbError::Execution { .. } => GatewayError::Procedure(ProcedureFailure::new(
                "transaction finalization",
                BindSet::new(),
                &e,
            )),
            other => GatewayError::Pool(other),
        })
    }

    /// Error branch: always roll back, never commit, regardless of policy.
    pub async fn abort(mut self) {
        if let Err(e) = self.session.rollback().await {
            warn!(procedure = %self.canonical, error = %e, "rollback after failure also failed");
        }
    }
}

/// Error-branch finalization for sessions not yet wrapped in a stream.
pub async fn rollback_quietly(session: &mut dyn Session) {
    if let Err(e) = session.rollback().await {
        error!(error = %e, "rollback on error path failed");
    }
}

/// Success-branch finalization for responses that bypass page streaming
/// (file downloads).
pub async fn finalize(
    session: &mut dyn Session,
    canonical: &str,
    policy: &TransactionPolicy,
) -> GatewayResult<()> {
    let result = match policy {
        TransactionPolicy::Commit => session.commit().await,
        TransactionPolicy::Rollback => session.rollback().await,
        TransactionPolicy::Custom(cb) => cb(session, canonical).await,
    };
    result.map_err(|e| match e {
        DbError::Execution { .. } => GatewayError::Procedure(ProcedureFailure::new(
            "transaction finalization",
            BindSet::new(),
            &e,
        )),
        other => GatewayError::Pool(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDb;
    use crate::db::Pool;
    use std::collections::HashMap;

    fn rows(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("line{}", i)).collect()
    }

    #[tokio::test]
    async fn short_fetch_terminates_stream() {
        let db = MockDb::new().page_chunks(vec![rows(1000), rows(1000), rows(400)]);
        let session = db.acquire().await.unwrap();
        let mut stream = PageStream::new(session, "owner.p".into(), TransactionPolicy::Commit);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().len(), 1000);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap().len(), 1000);
        assert_eq!(stream.next_chunk().await.unwrap().unwrap().len(), 400);
        // Terminated by the short fetch, not by an extra round trip.
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(db.executed_matching("owa.get_page"), 3);
        stream.finish().await.unwrap();
        assert_eq!(db.commits(), 1);
        assert_eq!(db.released(), 1);
    }

    #[tokio::test]
    async fn zero_row_first_fetch_is_immediately_terminal() {
        let db = MockDb::new();
        let session = db.acquire().await.unwrap();
        let mut stream = PageStream::new(session, "owner.p".into(), TransactionPolicy::Commit);
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(db.executed_matching("owa.get_page"), 1);
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert_eq!(db.executed_matching("owa.get_page"), 1);
    }

    #[tokio::test]
    async fn rollback_policy_rolls_back_on_success() {
        let db = MockDb::new().page_chunks(vec![rows(2)]);
        let session = db.acquire().await.unwrap();
        let mut stream = PageStream::new(session, "owner.p".into(), TransactionPolicy::Rollback);
        while stream.next_chunk().await.unwrap().is_some() {}
        stream.finish().await.unwrap();
        assert_eq!(db.commits(), 0);
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn custom_policy_receives_session_and_name() {
        use std::sync::Arc;
        let seen: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let policy = TransactionPolicy::Custom(Arc::new(move |session, name| {
            let seen = seen_in_cb.clone();
            let name = name.to_string();
            Box::pin(async move {
                seen.lock().push(name);
                session.commit().await
            })
        }));
        let db = MockDb::new().page_chunks(vec![rows(1)]);
        let session = db.acquire().await.unwrap();
        let mut stream = PageStream::new(session, "owner.app.page".into(), policy);
        while stream.next_chunk().await.unwrap().is_some() {}
        stream.finish().await.unwrap();
        assert_eq!(seen.lock().as_slice(), &["owner.app.page".to_string()]);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_becomes_procedure_error_and_abort_rolls_back() {
        let db = MockDb::new().fail_when(
            "owa.get_page",
            DbError::Execution { code: 6502, message: "ORA-06502: buffer error".into() },
        );
        let session = db.acquire().await.unwrap();
        let mut stream = PageStream::new(session, "owner.p".into(), TransactionPolicy::Commit);
        let err = stream.next_chunk().await.unwrap_err();
        assert!(matches!(err, GatewayError::Procedure(_)));
        stream.abort().await;
        assert_eq!(db.commits(), 0);
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.released(), 1);
    }

    #[tokio::test]
    async fn cgi_env_is_sent_once_with_parallel_arrays() {
        let db = MockDb::new();
        let mut session = db.acquire().await.unwrap();
        let meta = crate::cgi::RequestMeta {
            method: "GET".into(),
            prefix: "/pls/app".into(),
            proc_name: "p".into(),
            ..Default::default()
        };
        let env = crate::cgi::build(&meta, &axum::http::HeaderMap::new(), &HashMap::new());
        init_cgi(session.as_mut(), &env).await.unwrap();
        assert_eq!(db.cgi_inits(), 1);
    }
}
