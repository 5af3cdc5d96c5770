//! Luau-backed DNS provider scripts.
//!
//! A script must define two global functions:
//!
//! ```luau
//! function CreateRecord(domain, txtValue)
//!     -- publish TXT record, return true on success
//!     return true
//! end
//!
//! function DeleteRecord(domain, txtValue)
//!     return true
//! end
//! ```
//!
//! The Luau VM is not `Send`, so each invocation builds a fresh VM on the
//! blocking pool, loads the already-validated chunk, and calls the
//! requested function. Compilation here means validation: the chunk is
//! executed once in a throwaway VM to surface syntax errors (with Luau's
//! own line-numbered diagnostics) and missing function definitions before
//! the provider is ever cached.

use async_trait::async_trait;
use mlua::{Function, Lua};
use std::sync::Arc;
use tracing::debug;

use super::{DnsError, DnsProvider, ProviderCompiler};

/// Compiles Luau source into a [`DnsProvider`].
#[derive(Debug, Default)]
pub struct LuaCompiler;

impl LuaCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderCompiler for LuaCompiler {
    fn compile(&self, name: &str, source: &str) -> Result<Arc<dyn DnsProvider>, DnsError> {
        // Validate eagerly so the operator sees diagnostics at save time,
        // not on the next certificate renewal.
        let lua = load_chunk(name, source)?;
        for required in ["CreateRecord", "DeleteRecord"] {
            let value: mlua::Value = lua
                .globals()
                .get(required)
                .map_err(|e| DnsError::Execution(e.to_string()))?;
            if !matches!(value, mlua::Value::Function(_)) {
                return Err(DnsError::Compile(format!(
                    "script does not define function {required}(domain, txtValue)"
                )));
            }
        }
        debug!(provider = name, "provider script validated");

        Ok(Arc::new(LuaProvider {
            name: name.to_string(),
            source: source.into(),
        }))
    }
}

/// A validated script, re-instantiated per call.
struct LuaProvider {
    name: String,
    source: Arc<str>,
}

impl LuaProvider {
    async fn invoke(&self, function: &'static str, domain: &str, txt_value: &str) -> Result<bool, DnsError> {
        let name = self.name.clone();
        let source = Arc::clone(&self.source);
        let domain = domain.to_string();
        let txt_value = txt_value.to_string();

        tokio::task::spawn_blocking(move || {
            let lua = load_chunk(&name, &source)?;
            let f: Function = lua
                .globals()
                .get(function)
                .map_err(|e| DnsError::Execution(e.to_string()))?;
            f.call::<_, bool>((domain.as_str(), txt_value.as_str()))
                .map_err(|e| DnsError::Execution(e.to_string()))
        })
        .await
        .map_err(|e| DnsError::Execution(format!("script task panicked: {e}")))?
    }
}

#[async_trait]
impl DnsProvider for LuaProvider {
    async fn create_record(&self, domain: &str, txt_value: &str) -> Result<(), DnsError> {
        if self.invoke("CreateRecord", domain, txt_value).await? {
            Ok(())
        } else {
            Err(DnsError::Refused {
                operation: "create",
                domain: domain.to_string(),
            })
        }
    }

    async fn delete_record(&self, domain: &str, txt_value: &str) -> Result<(), DnsError> {
        if self.invoke("DeleteRecord", domain, txt_value).await? {
            Ok(())
        } else {
            Err(DnsError::Refused {
                operation: "delete",
                domain: domain.to_string(),
            })
        }
    }
}

/// Build a VM and run the chunk, mapping load/run errors to
/// [`DnsError::Compile`] with the VM's diagnostic intact.
fn load_chunk(name: &str, source: &str) -> Result<Lua, DnsError> {
    let lua = Lua::new();
    lua.load(source)
        .set_name(name)
        .exec()
        .map_err(|e| DnsError::Compile(e.to_string()))?;
    Ok(lua)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_SCRIPT: &str = r#"
records = {}

function CreateRecord(domain, txtValue)
    records[domain] = txtValue
    return true
end

function DeleteRecord(domain, txtValue)
    records[domain] = nil
    return true
end
"#;

    #[tokio::test]
    async fn test_compile_and_invoke() {
        let provider = LuaCompiler::new().compile("test", GOOD_SCRIPT).unwrap();
        provider
            .create_record("example.com", "token-value")
            .await
            .unwrap();
        provider
            .delete_record("example.com", "token-value")
            .await
            .unwrap();
    }

    #[test]
    fn test_syntax_error_reports_line_number() {
        let source = "function CreateRecord(domain, txtValue)\nreturn true\nend\nthis is not luau";
        let err = match LuaCompiler::new().compile("broken", source) {
            Ok(_) => panic!("broken script was accepted"),
            Err(err) => err,
        };
        let message = err.to_string();
        assert!(matches!(err, DnsError::Compile(_)), "{message}");
        // Luau diagnostics carry the chunk name and the offending line
        assert!(message.contains('4'), "missing line number: {message}");
    }

    #[test]
    fn test_missing_function_rejected() {
        let err = match LuaCompiler::new().compile("partial", "function CreateRecord(d, t) return true end") {
            Ok(_) => panic!("script without DeleteRecord was accepted"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("DeleteRecord"));
    }

    #[tokio::test]
    async fn test_false_return_is_hard_failure() {
        let source = r#"
function CreateRecord(domain, txtValue) return false end
function DeleteRecord(domain, txtValue) return true end
"#;
        let provider = LuaCompiler::new().compile("refuser", source).unwrap();
        let err = provider.create_record("example.com", "v").await.unwrap_err();
        assert!(matches!(err, DnsError::Refused { .. }));
    }
}
