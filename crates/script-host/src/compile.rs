//! Compiling source into `CompiledUnit`s
//!
//! The Lua parser is the authority: a unit exists only if it accepted the
//! source. Units carry source text, never precompiled chunks, and every
//! load uses text mode so binary chunks are refused.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use mlua::{ChunkMode, Lua, LuaOptions, StdLib};
use tether_engine_core::crypto::{self, HashAlgorithm};
use tether_policy::{resolve_workspace_path, validate_source_size, Limits};
use thiserror::Error;

use crate::BridgeError;

/// Source rejected by the parser
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    /// Parser message, prefixed with the chunk name and line
    pub message: String,
    pub line: Option<u32>,
}

/// Source accepted by the parser, with its diagnostic name.
///
/// Two units with the same bytes are interchangeable: equality and hashing
/// ignore the name. Cloning is cheap.
#[derive(Clone)]
pub struct CompiledUnit {
    name: Arc<str>,
    source: Arc<[u8]>,
    digest: [u8; 32],
}

impl CompiledUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// SHA-256 of the source, usable as a cache key
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn digest_hex(&self) -> String {
        crypto::hex_encode(&self.digest)
    }

    pub(crate) fn chunk_name(&self) -> String {
        chunk_name(&self.name)
    }
}

impl PartialEq for CompiledUnit {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.source == other.source
    }
}

impl Eq for CompiledUnit {}

impl std::hash::Hash for CompiledUnit {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("name", &self.name)
            .field("len", &self.source.len())
            .field("digest", &self.digest_hex())
            .finish()
    }
}

/// `=name` makes Lua print the name verbatim in messages
fn chunk_name(name: &str) -> String {
    format!("={name}")
}

/// Parse `source` and wrap it in a unit named `name`
pub fn compile(source: impl AsRef<[u8]>, name: &str) -> Result<CompiledUnit, CompileError> {
    let source = source.as_ref();
    let checker = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(|e| CompileError {
        message: format!("{name}: parser unavailable: {e}"),
        line: None,
    })?;

    checker
        .load(source)
        .set_name(chunk_name(name))
        .set_mode(ChunkMode::Text)
        .into_function()
        .map_err(|e| syntax_error(name, e))?;

    let digest = crypto::digest(HashAlgorithm::Sha256, source);
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(&digest);
    tracing::trace!(%name, len = source.len(), "Compiled unit");

    Ok(CompiledUnit {
        name: Arc::from(name),
        source: Arc::from(source),
        digest: fixed,
    })
}

/// Compile with the size limit applied first
pub fn compile_checked(
    source: impl AsRef<[u8]>,
    name: &str,
    limits: &Limits,
) -> Result<CompiledUnit, BridgeError> {
    let source = source.as_ref();
    validate_source_size(source.len(), limits)
        .into_result()
        .map_err(BridgeError::Rejected)?;
    Ok(compile(source, name)?)
}

/// Read a workspace file and compile it, named by its relative path
pub fn compile_file(
    path: &str,
    workspace_root: &Path,
    limits: &Limits,
) -> Result<CompiledUnit, BridgeError> {
    let full = resolve_workspace_path(path, workspace_root).map_err(BridgeError::Rejected)?;

    let len = std::fs::metadata(&full)
        .map_err(|e| BridgeError::Rejected(io_rejection(path, &e)))?
        .len();
    validate_source_size(usize::try_from(len).unwrap_or(usize::MAX), limits)
        .into_result()
        .map_err(BridgeError::Rejected)?;

    let source = std::fs::read(&full).map_err(|e| BridgeError::Rejected(io_rejection(path, &e)))?;
    compile_checked(source, path, limits)
}

fn io_rejection(path: &str, error: &std::io::Error) -> tether_protocol::Rejection {
    tether_protocol::Rejection::new("io_error", format!("Cannot read '{path}': {error}"))
}

fn syntax_error(name: &str, error: mlua::Error) -> CompileError {
    let message = match error {
        mlua::Error::SyntaxError { message, .. } => message,
        other => other.to_string(),
    };
    let line = line_of(&message);
    let message = if message.contains(name) {
        message
    } else {
        format!("{name}: {message}")
    };
    CompileError { message, line }
}

/// First `:<digits>:` field of a Lua diagnostic
fn line_of(message: &str) -> Option<u32> {
    message
        .split(':')
        .skip(1)
        .find(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|part| part.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_source_compiles() {
        let unit = compile("return 1 + 1", "t").unwrap();
        assert_eq!(unit.name(), "t");
        assert_eq!(unit.source(), b"return 1 + 1");
        assert_eq!(unit.digest_hex().len(), 64);
    }

    #[test]
    fn syntax_error_names_chunk_and_line() {
        let err = compile("print(", "t").unwrap_err();
        assert!(err.message.contains('t'));
        assert_eq!(err.line, Some(1));

        let err = compile("local a = 1\nlocal b = = 2", "multi").unwrap_err();
        assert!(err.message.starts_with("multi:"));
        assert_eq!(err.line, Some(2));
        assert_eq!(BridgeError::from(err).status(), tether_protocol::StatusCode::CompileError);
    }

    #[test]
    fn equality_is_by_bytes() {
        let a = compile("return 42", "a").unwrap();
        let b = compile("return 42", "b").unwrap();
        let c = compile("return 43", "a").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
    }

    #[test]
    fn binary_chunks_refused() {
        let err = compile(b"\x1bLua\x54\x00", "bin").unwrap_err();
        assert!(err.message.contains("bin"));
    }

    #[test]
    fn size_limit_applies() {
        let limits = Limits {
            max_source_bytes: 8,
            ..Limits::default()
        };
        assert!(compile_checked("return 1", "ok", &limits).is_ok());
        assert!(matches!(
            compile_checked("return 12345", "big", &limits),
            Err(BridgeError::Rejected(r)) if r.code == "source_too_large"
        ));
    }

    #[test]
    fn compile_from_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/main.lua"), "return 'file'").unwrap();

        let unit = compile_file("scripts/main.lua", dir.path(), &Limits::default()).unwrap();
        assert_eq!(unit.name(), "scripts/main.lua");

        assert!(matches!(
            compile_file("../outside.lua", dir.path(), &Limits::default()),
            Err(BridgeError::Rejected(_))
        ));
        assert!(matches!(
            compile_file("missing.lua", dir.path(), &Limits::default()),
            Err(BridgeError::Rejected(r)) if r.code == "io_error"
        ));
    }

    #[test]
    fn line_parsing() {
        assert_eq!(line_of("t:3: unexpected symbol"), Some(3));
        assert_eq!(line_of("[string \"t\"]:12: oops"), Some(12));
        assert_eq!(line_of("no line here"), None);
    }
}
