//! Classifies worker references and turns them into loadable entries.
//!
//! Classification is purely syntactic. Nothing here touches the file
//! system, so a missing file is only noticed when the worker loads it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use super::error::{WorkerError, WorkerResult};

/// How the entry is evaluated inside the worker.
///
/// Chosen by the caller; never sniffed from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// CommonJS-style script with `require`, `module` and `exports`
    #[default]
    Classic,
    /// ECMAScript module
    Module,
}

impl ScriptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::Classic => "classic",
            ScriptKind::Module => "module",
        }
    }

    /// Extension used for materialized entries of this kind
    pub fn extension(self) -> &'static str {
        match self {
            ScriptKind::Classic => "cjs",
            ScriptKind::Module => "mjs",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(ScriptKind::Classic),
            "module" => Ok(ScriptKind::Module),
            other => Err(format!(
                "'{other}' is not a valid worker type, expected 'classic' or 'module'"
            )),
        }
    }
}

/// The value a worker is constructed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReference {
    /// Relative or absolute file path
    FilePath(PathBuf),
    /// Absolute `file:` URL
    FileUrl(Url),
    /// `data:<mime>[;base64],<payload>`
    DataUrl {
        mime: String,
        base64: bool,
        payload: String,
    },
}

/// Where the entry source lives once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    File(PathBuf),
    Inline(String),
}

/// Resolved, loadable form of a [`WorkerReference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub source: EntrySource,
    pub kind: ScriptKind,
}

impl WorkerReference {
    pub fn parse(input: &str) -> WorkerResult<Self> {
        if input.trim().is_empty() {
            return Err(WorkerError::UnsupportedReferenceKind(input.to_string()));
        }

        if let Some(scheme) = scheme_of(input) {
            if scheme.eq_ignore_ascii_case("data") {
                return parse_data_url(input);
            }
            if scheme.eq_ignore_ascii_case("file") {
                let url = Url::parse(input)
                    .map_err(|_| WorkerError::UnsupportedReferenceKind(input.to_string()))?;
                return Ok(WorkerReference::FileUrl(url));
            }
            return Err(WorkerError::UnsupportedReferenceKind(input.to_string()));
        }

        Ok(WorkerReference::FilePath(PathBuf::from(input)))
    }

    /// Produce the entry descriptor. Relative paths are anchored at `base_dir`;
    /// data payloads are decoded here.
    pub fn resolve(&self, kind: ScriptKind, base_dir: &Path) -> WorkerResult<EntryDescriptor> {
        let source = match self {
            WorkerReference::FilePath(path) if path.is_absolute() => EntrySource::File(path.clone()),
            WorkerReference::FilePath(path) => EntrySource::File(base_dir.join(path)),
            WorkerReference::FileUrl(url) => {
                let path = url
                    .to_file_path()
                    .map_err(|_| WorkerError::UnsupportedReferenceKind(url.to_string()))?;
                EntrySource::File(path)
            }
            WorkerReference::DataUrl {
                base64, payload, ..
            } => EntrySource::Inline(decode_payload(*base64, payload)?),
        };
        Ok(EntryDescriptor { source, kind })
    }
}

impl TryFrom<Url> for WorkerReference {
    type Error = WorkerError;

    fn try_from(url: Url) -> WorkerResult<Self> {
        match url.scheme() {
            "file" => Ok(WorkerReference::FileUrl(url)),
            "data" => parse_data_url(url.as_str()),
            _ => Err(WorkerError::UnsupportedReferenceKind(url.to_string())),
        }
    }
}

impl fmt::Display for WorkerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerReference::FilePath(path) => write!(f, "{}", path.display()),
            WorkerReference::FileUrl(url) => write!(f, "{url}"),
            WorkerReference::DataUrl { mime, base64, .. } => {
                write!(f, "data:{mime}{}", if *base64 { ";base64" } else { "" })
            }
        }
    }
}

/// URL scheme of `input`, if it has one. Single letters are drive letters.
fn scheme_of(input: &str) -> Option<&str> {
    let (scheme, _) = input.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    (valid && scheme.len() > 1).then_some(scheme)
}

fn parse_data_url(input: &str) -> WorkerResult<WorkerReference> {
    let rest = &input["data:".len()..];
    let (header, payload) = rest.split_once(',').ok_or_else(|| {
        WorkerError::MalformedDataReference("missing ',' between header and payload".to_string())
    })?;

    let mut params = header.split(';');
    let mime = params
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or("text/plain")
        .to_string();
    let base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    Ok(WorkerReference::DataUrl {
        mime,
        base64,
        payload: payload.to_string(),
    })
}

fn decode_payload(base64: bool, payload: &str) -> WorkerResult<String> {
    if !base64 {
        return Ok(payload.to_string());
    }
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| WorkerError::MalformedDataReference(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| WorkerError::MalformedDataReference(e.to_string()))
}
