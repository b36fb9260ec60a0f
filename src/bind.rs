//! Argument binding: turn a resolved procedure plus the request's
//! arguments into an executable anonymous block and its bind set.
//!
//! Two calling conventions exist. Fixed builds one named bind per
//! declared argument and needs the procedure's signature from the
//! catalog; flexible passes two parallel arrays (names, values) and is
//! used when the signature comes back empty, which by convention means
//! the procedure takes a variable argument list. The choice is made once
//! per invocation from the describe result, never per request flag.

use std::sync::Arc;

use tracing::warn;

use crate::args::{ArgValue, ArgumentSet};
use crate::cache::BindingCache;
use crate::db::{BindSet, BindSpec, BindValue, DbError, Session};
use crate::error::{GatewayError, GatewayResult};
use crate::resolve::is_safe_ident;

/// The bulk describe call cannot report more arguments than this.
pub const MAX_DESCRIBE_ARGS: usize = 1000;

const DESCRIBE_SQL: &str = "begin dbms_describe.describe_procedure(:object_name, null, null, :overload, :position, :level, :argument_name, :datatype, :default_value, :in_out, :length, :precision, :scale, :radix, :spare); end;";

/// Declared argument list in declaration order: name (lower case) and
/// database type.
pub type ArgSignature = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStrategy {
    Fixed,
    Flexible,
}

/// Executable statement plus bind parameters for one invocation. Never
/// cached itself; only the signature that shaped it is.
#[derive(Debug, Clone)]
pub struct BindPlan {
    pub statement: String,
    pub binds: BindSet,
    pub strategy: BindStrategy,
}

pub struct Binder {
    cache: Arc<BindingCache<ArgSignature>>,
}

impl Binder {
    pub fn new(cache: Arc<BindingCache<ArgSignature>>) -> Self {
        Binder { cache }
    }

    /// Build the plan for `canonical` against `args`, describing the
    /// procedure on first contact and memoizing the signature.
    pub async fn plan(
        &self,
        session: &mut dyn Session,
        canonical: &str,
        args: &ArgumentSet,
    ) -> GatewayResult<BindPlan> {
        let signature = match self.cache.get(canonical) {
            Some(sig) => sig,
            None => {
                let sig = describe(session, canonical).await?;
                self.cache.set(canonical, sig.clone());
                sig
            }
        };
        if signature.is_empty() {
            Ok(flexible_plan(canonical, args))
        } else {
            fixed_plan(canonical, &signature, args)
        }
    }
}

/// Introspect the declared arguments of `canonical` through the bulk
/// describe call. A signature filling the whole describe window is
/// rejected rather than silently truncated.
async fn describe(session: &mut dyn Session, canonical: &str) -> GatewayResult<ArgSignature> {
    let mut binds = BindSet::new();
    binds.push("object_name", BindSpec::input(BindValue::Str(canonical.to_string())));
    binds.push("overload", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("position", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("level", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("argument_name", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("datatype", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("default_value", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("in_out", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("length", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("precision", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("scale", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("radix", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));
    binds.push("spare", BindSpec::output().with_bound(MAX_DESCRIBE_ARGS));

    let outcome = match session.execute(DESCRIBE_SQL, &binds).await {
        Ok(o) => o,
        Err(DbError::Execution { message, .. }) => {
            return Err(GatewayError::NotFound(format!(
                "unable to describe '{}': {}",
                canonical, message
            )));
        }
        Err(e) => return Err(GatewayError::Pool(e)),
    };

    let names = outcome.out_str_array("argument_name").unwrap_or(&[]);
    let types = outcome.out_str_array("datatype").unwrap_or(&[]);
    if names.len() >= MAX_DESCRIBE_ARGS {
        return Err(GatewayError::BadRequest(format!(
            "procedure '{}' declares too many arguments for the describe window ({})",
            canonical, MAX_DESCRIBE_ARGS
        )));
    }

    let mut sig = ArgSignature::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let dtype = types.get(i).cloned().unwrap_or_default();
        sig.push((name.to_ascii_lowercase(), dtype));
    }
    Ok(sig)
}

/// One named bind per declared argument, `p_<name>`. Request values fill
/// declared slots; declared arguments the request omits bind empty;
/// request arguments the procedure does not declare are dropped with a
/// warning.
fn fixed_plan(canonical: &str, signature: &ArgSignature, args: &ArgumentSet) -> GatewayResult<BindPlan> {
    let mut fragments = Vec::with_capacity(signature.len());
    let mut binds = BindSet::new();
    for (name, _dtype) in signature {
        if !is_safe_ident(name) {
            return Err(GatewayError::Internal(format!(
                "catalog returned an unusable argument name for '{}': '{}'",
                canonical, name
            )));
        }
        let bind_name = format!("p_{}", name);
        let spec = match args.get_ignore_case(name) {
            None => BindSpec::input(BindValue::Str(String::new())),
            Some(ArgValue::Single(v)) => BindSpec::input(BindValue::Str(v.clone())),
            Some(ArgValue::Multi(vs)) => {
                BindSpec::input(BindValue::StrArray(vs.clone())).with_bound(vs.len())
            }
        };
        fragments.push(format!("{} => :{}", name, bind_name));
        binds.push(bind_name, spec);
    }
    for (name, _) in args.iter() {
        if !signature.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
            warn!(procedure = %canonical, argument = %name, "dropping undeclared request argument");
        }
    }
    let statement = format!("begin {}({}); end;", canonical, fragments.join(", "));
    Ok(BindPlan { statement, binds, strategy: BindStrategy::Fixed })
}

/// Two parallel arrays, names and values, equal length by construction.
fn flexible_plan(canonical: &str, args: &ArgumentSet) -> BindPlan {
    let (names, values) = args.flattened();
    debug_assert_eq!(names.len(), values.len());
    let bound = names.len().max(1);
    let mut binds = BindSet::new();
    binds.push("argnames", BindSpec::input(BindValue::StrArray(names)).with_bound(bound));
    binds.push("argvalues", BindSpec::input(BindValue::StrArray(values)).with_bound(bound));
    let statement = format!("begin {}(:argnames, :argvalues); end;", canonical);
    BindPlan { statement, binds, strategy: BindStrategy::Flexible }
}
