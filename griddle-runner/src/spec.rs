//! Test specifications.
//!
//! Each test program carries its metadata in a block embedded near the top of
//! its source file:
//!
//! ```c
//! /* --- griddle
//! category = "pthread"
//! tags = ["smoke"]
//! expect-exit-codes = [0]
//! --- */
//! ```
//!
//! The block body is TOML. Specs are parsed once at discovery time and shared
//! read-only between every run of the same test.

use crate::errors::SpecParseError;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::debug;

/// Opening delimiter of the embedded metadata block.
const BLOCK_START: &str = "--- griddle";
/// Closing delimiter of the embedded metadata block.
const BLOCK_END: &str = "---";

/// Immutable description of one test case.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TestSpec {
    /// The test name, taken from the source file stem.
    #[serde(skip)]
    pub name: String,

    /// Category the test belongs to (used for report grouping and filtering).
    pub category: String,

    /// Free-form tags for filtering.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Exit codes the test program is allowed to produce.
    #[serde(default = "default_exit_codes")]
    pub expect_exit_codes: Vec<i32>,

    /// Exact stdout the test program must produce, if any.
    #[serde(default)]
    pub expect_stdout: Option<String>,

    /// Whether hitting the test timeout counts as expected behavior.
    #[serde(default)]
    pub expect_timeout: bool,

    /// Per-test timeout override.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Disabled tests are reported but never executed.
    #[serde(default)]
    pub disabled: bool,
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

impl TestSpec {
    /// Parses a spec out of a test source file's text.
    ///
    /// Returns `Ok(None)` if the file carries no metadata block: such files
    /// are not tests and are skipped at discovery time.
    pub fn from_source(name: &str, path: &Utf8Path, text: &str) -> Result<Option<Self>, SpecParseError> {
        let Some(block) = extract_metadata_block(text) else {
            return Ok(None);
        };

        let mut spec: TestSpec =
            toml::from_str(block).map_err(|error| SpecParseError::Metadata {
                path: path.to_owned(),
                error,
            })?;
        spec.name = name.to_owned();
        Ok(Some(spec))
    }
}

/// Extracts the text between the `--- griddle` and `---` delimiter lines.
fn extract_metadata_block(text: &str) -> Option<&str> {
    let start = text.find(BLOCK_START)?;
    let body = &text[start + BLOCK_START.len()..];
    let body = body.strip_prefix('\r').unwrap_or(body);
    let body = body.strip_prefix('\n')?;

    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if line.trim_end() == BLOCK_END {
            return Some(&body[..offset]);
        }
        offset += line.len();
    }
    None
}

/// Discovers test specs by scanning `dir` for C sources whose stem starts
/// with `prefix` (an empty prefix matches everything).
///
/// Files without a metadata block are skipped with a debug log; malformed
/// blocks are hard errors.
pub fn discover_specs(dir: &Utf8Path, prefix: &str) -> Result<Vec<Arc<TestSpec>>, SpecParseError> {
    let entries = dir.read_dir_utf8().map_err(|error| SpecParseError::ListDir {
        path: dir.to_owned(),
        error,
    })?;

    let mut paths: Vec<Utf8PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| SpecParseError::ListDir {
            path: dir.to_owned(),
            error,
        })?;
        let path = entry.into_path();
        if path.extension() != Some("c") {
            continue;
        }
        match path.file_stem() {
            Some(stem) if stem.starts_with(prefix) => paths.push(path),
            _ => {}
        }
    }
    paths.sort();

    let mut specs = Vec::new();
    for path in paths {
        let name = path
            .file_stem()
            .expect("paths with extensions have stems")
            .to_owned();
        let text = std::fs::read_to_string(&path).map_err(|error| SpecParseError::Read {
            path: path.clone(),
            error,
        })?;
        match TestSpec::from_source(&name, &path, &text)? {
            Some(spec) => specs.push(Arc::new(spec)),
            None => debug!(target: "griddle::spec", %path, "no metadata block, skipping"),
        }
    }
    Ok(specs)
}

/// Filters specs by category and tag lists. Empty lists match everything.
pub fn filter_specs(
    specs: Vec<Arc<TestSpec>>,
    categories: &[String],
    tags: &[String],
) -> Vec<Arc<TestSpec>> {
    specs
        .into_iter()
        .filter(|spec| categories.is_empty() || categories.contains(&spec.category))
        .filter(|spec| tags.is_empty() || tags.iter().any(|tag| spec.tags.contains(tag)))
        .collect()
}
