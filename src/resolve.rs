//! Procedure name resolution and security sanitization.
//!
//! Order is load-bearing: the path alias is expanded first, then the
//! exclusion list and the validation callback are applied, and only then
//! is the name-resolution cache consulted. The cache key is the untrusted
//! requested name, so the authorization gates must re-run on every request
//! or a cached mapping could bypass them.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::cache::BindingCache;
use crate::config::RouteConfig;
use crate::db::{BindSet, BindSpec, BindValue, DbError, Session};
use crate::error::{GatewayError, GatewayResult};

/// Canonical names longer than this are rejected by the catalog facility.
pub const MAX_CANONICAL_LEN: usize = 400;

const NAME_RESOLVE_SQL: &str = "begin dbms_utility.name_resolve(:name, 1, :schema, :part1, :part2, :dblink, :part_type, :object_id); end;";

/// Packages a legacy gateway must never expose. Applies when a route
/// configures no exclusion list of its own.
pub const DEFAULT_EXCLUSION_LIST: &[&str] = &[
    "sys.*",
    "dbms_*",
    "utl_*",
    "owa.*",
    "owa_*",
    "htp.*",
    "htf.*",
    "wpg_*",
];

/// True when every character is legal in a dotted database identifier.
/// Names are later interpolated into anonymous blocks, so anything else
/// is rejected outright.
pub fn is_safe_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#' | '.'))
}

/// Compile a glob-like exclusion pattern (`*` any run, `?` one char) into
/// an anchored case-insensitive regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

pub struct Resolver {
    patterns: Vec<Regex>,
    validation_fn: Option<String>,
    path_alias: Option<(String, String)>,
    cache: Arc<BindingCache<String>>,
}

impl Resolver {
    pub fn new(route: &RouteConfig, cache: Arc<BindingCache<String>>) -> anyhow::Result<Self> {
        let raw_patterns: Vec<String> = match &route.exclusion_list {
            Some(list) => list.clone(),
            None => DEFAULT_EXCLUSION_LIST.iter().map(|s| s.to_string()).collect(),
        };
        let mut patterns = Vec::with_capacity(raw_patterns.len());
        for p in &raw_patterns {
            patterns.push(glob_to_regex(p)?);
        }
        if let Some(f) = &route.request_validation_function {
            anyhow::ensure!(is_safe_ident(f), "invalid request_validation_function: '{}'", f);
        }
        if let Some(p) = &route.path_alias_procedure {
            anyhow::ensure!(is_safe_ident(p), "invalid path_alias_procedure: '{}'", p);
        }
        let path_alias = match (&route.path_alias, &route.path_alias_procedure) {
            (Some(alias), Some(proc)) => Some((alias.clone(), proc.clone())),
            _ => None,
        };
        Ok(Resolver {
            patterns,
            validation_fn: route.request_validation_function.clone(),
            path_alias,
            cache,
        })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(name))
    }

    /// Resolve a requested target to its canonical callable name.
    pub async fn resolve(&self, session: &mut dyn Session, requested: &str) -> GatewayResult<String> {
        if !is_safe_ident(requested) {
            return Err(GatewayError::Forbidden(format!(
                "invalid procedure name: '{}'",
                requested
            )));
        }

        // Path alias expands before any other gate; the alias resolver's
        // output is never cached.
        let mut target = requested.to_string();
        if let Some((alias, alias_proc)) = &self.path_alias {
            if target.eq_ignore_ascii_case(alias) {
                target = self.expand_alias(session, alias_proc, alias).await?;
                if !is_safe_ident(&target) {
                    return Err(GatewayError::BadRequest(format!(
                        "path alias resolved to an invalid target: '{}'",
                        target
                    )));
                }
            }
        }

        if self.is_excluded(&target) {
            return Err(GatewayError::Forbidden(format!("procedure '{}' is excluded", target)));
        }

        if let Some(validation_fn) = &self.validation_fn {
            self.run_validation(session, validation_fn, &target).await?;
        }

        // Authorization gates passed; only now may the cache short-circuit
        // catalog resolution.
        if let Some(canonical) = self.cache.get(&target) {
            return Ok(canonical);
        }

        let canonical = self.catalog_resolve(session, &target).await?;
        self.cache.set(target, canonical.clone());
        Ok(canonical)
    }

    async fn expand_alias(
        &self,
        session: &mut dyn Session,
        alias_proc: &str,
        alias: &str,
    ) -> GatewayResult<String> {
        let statement = format!("begin :target := {}(:alias_path); end;", alias_proc);
        let mut binds = BindSet::new();
        binds.push("target", BindSpec::output());
        binds.push("alias_path", BindSpec::input(BindValue::Str(alias.to_string())));
        let outcome = session
            .execute(&statement, &binds)
            .await
            .map_err(|e| map_resolution_error(e, "path alias resolution failed"))?;
        match outcome.out_str("target") {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(GatewayError::BadRequest("path alias resolved to nothing".into())),
        }
    }

    async fn run_validation(
        &self,
        session: &mut dyn Session,
        validation_fn: &str,
        target: &str,
    ) -> GatewayResult<()> {
        let statement = format!(
            "begin :result := case when {}(:proc_name) then 1 else 0 end; end;",
            validation_fn
        );
        let mut binds = BindSet::new();
        binds.push("result", BindSpec::output());
        binds.push("proc_name", BindSpec::input(BindValue::Str(target.to_string())));
        let outcome = session
            .execute(&statement, &binds)
            .await
            .map_err(|e| map_resolution_error(e, "request validation failed"))?;
        if outcome.out_int("result") == Some(1) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "request validation rejected '{}'",
                target
            )))
        }
    }

    async fn catalog_resolve(&self, session: &mut dyn Session, target: &str) -> GatewayResult<String> {
        let mut binds = BindSet::new();
        binds.push("name", BindSpec::input(BindValue::Str(target.to_string())));
        binds.push("schema", BindSpec::output());
        binds.push("part1", BindSpec::output());
        binds.push("part2", BindSpec::output());
        binds.push("dblink", BindSpec::output());
        binds.push("part_type", BindSpec::output());
        binds.push("object_id", BindSpec::output());
        let outcome = match session.execute(NAME_RESOLVE_SQL, &binds).await {
            Ok(o) => o,
            Err(DbError::Execution { code, message }) => {
                debug!(target = %target, code, %message, "name resolution miss");
                return Err(GatewayError::NotFound(format!("procedure not found: '{}'", target)));
            }
            Err(e) => return Err(GatewayError::Pool(e)),
        };
        let mut canonical = String::new();
        for part in ["schema", "part1", "part2"] {
            if let Some(v) = outcome.out_str(part) {
                if !v.is_empty() {
                    if !canonical.is_empty() {
                        canonical.push('.');
                    }
                    canonical.push_str(v);
                }
            }
        }
        if canonical.is_empty() {
            return Err(GatewayError::NotFound(format!("procedure not found: '{}'", target)));
        }
        canonical = canonical.to_ascii_lowercase();
        if canonical.len() > MAX_CANONICAL_LEN {
            // cut on a char boundary; byte 400 may fall inside a
            // multibyte identifier character
            let mut cut = MAX_CANONICAL_LEN;
            while !canonical.is_char_boundary(cut) {
                cut -= 1;
            }
            canonical.truncate(cut);
        }
        Ok(canonical)
    }
}

fn map_resolution_error(err: DbError, what: &str) -> GatewayError {
    match err {
        DbError::Execution { message, .. } => GatewayError::Forbidden(format!("{}: {}", what, message)),
        other => GatewayError::Pool(other),
    }
}
