pub mod context;
pub mod datum;
pub mod error;
pub mod expression;
pub mod template;
pub mod tokenizer;

use std::collections::BTreeMap;
use std::path::PathBuf;

use error::WeftError;
use template::TemplateParser;

pub use context::{Callable, Context, EvalContext};
pub use datum::{Datum, DATUM_MAX_INT, DATUM_MIN_INT};
pub use error::{ErrorKind, Position};
pub use template::Template;

// ── Loaders ────────────────────────────────────────────────────────

/// Supplies the source text of included templates. Paths are resolved
/// relative to the including template before the loader sees them.
pub trait Loader {
    fn load(&self, path: &str) -> Result<String, String>;
}

/// Loads included templates from the filesystem, relative to a root
/// directory.
pub struct FileLoader {
    root: PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> FileLoader {
        FileLoader { root: root.into() }
    }
}

impl Loader for FileLoader {
    fn load(&self, path: &str) -> Result<String, String> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full)
            .map_err(|e| format!("Could not read '{}': {}", full.display(), e))
    }
}

/// Serves included templates from an in-memory table; unknown paths are
/// load failures.
#[derive(Default)]
pub struct MapLoader {
    sources: BTreeMap<String, String>,
}

impl MapLoader {
    pub fn new() -> MapLoader {
        MapLoader::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(path.into(), source.into());
    }
}

impl Loader for MapLoader {
    fn load(&self, path: &str) -> Result<String, String> {
        match self.sources.get(path) {
            Some(source) => Ok(source.clone()),
            None => Err(format!("No template registered for '{}'", path)),
        }
    }
}

// ── Core API ───────────────────────────────────────────────────────

/// Parse template source without evaluating it. `#include` statements
/// fail since no loader is available.
pub fn parse_template(file: &str, source: &str) -> Result<Template, WeftError> {
    TemplateParser::new(None).parse(file, source)
}

/// Parse template source, resolving `#include` statements through the
/// given loader at parse time.
pub fn parse_template_with_loader(
    file: &str,
    source: &str,
    loader: &dyn Loader,
) -> Result<Template, WeftError> {
    TemplateParser::new(Some(loader)).parse(file, source)
}

/// Load `path` through the loader and parse it, resolving includes
/// through the same loader.
pub fn parse_template_from_loader(path: &str, loader: &dyn Loader) -> Result<Template, WeftError> {
    let source = loader
        .load(path)
        .map_err(|message| WeftError::include(message, 0))?;
    parse_template_with_loader(path, &source, loader)
}

#[cfg(test)]
mod tests;
