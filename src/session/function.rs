//! Function argument expansion and execution

use std::collections::BTreeMap;

use regex::{Captures, Regex};
use tracing::info;

use super::{resolve_function_env, Context};
use crate::error::Result;

lazy_static::lazy_static! {
    static ref VAR_REFERENCE: Regex = Regex::new(r"\$\((\w+)\)").unwrap();
}

/// Replace `$(VAR)` references in `value`
///
/// References to variables missing from `vars` are kept verbatim.
pub fn expand(value: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_REFERENCE
        .replace_all(value, |caps: &Captures| match vars.get(&caps[1]) {
            Some(resolved) => resolved.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Expand every argument against the resolved environment
pub fn expand_args(args: &[String], vars: &BTreeMap<String, String>) -> Vec<String> {
    args.iter().map(|arg| expand(arg, vars)).collect()
}

impl Context {
    /// Run a Function inside a target container
    pub async fn run_function(&self, container: &str, function_name: &str) -> Result<()> {
        let function = self
            .cluster
            .get_function(self.namespace(), function_name)
            .await?;
        let env = resolve_function_env(self.cluster.as_ref(), self.namespace(), &function).await?;
        let args = expand_args(&function.spec.args, &env);

        info!(container = %container, function = %function_name, "Running function");
        self.runner
            .run(container, &function.spec.command, &args, &env)
            .await
    }
}
