//! Placeholder references embedded in schema values.
//!
//! A schema leaf either carries a literal or a placeholder naming where the
//! value is fetched from:
//!
//! ```text
//! $pre-run-md:key1:key2      device metadata snapshot, nested lookup
//! $pre-run-cpt:cpt1:cpt2     live read of a device sub-component at run start
//! $post-run:name             value recorded in the run's documents
//! $post-run                  the device's own primary readback
//! ```
//!
//! Parsing is total: any string that is not a well-formed placeholder is a literal.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

pub const PRE_RUN_MD_PREFIX: &str = "pre-run-md";
pub const PRE_RUN_CPT_PREFIX: &str = "pre-run-cpt";
pub const POST_RUN_PREFIX: &str = "post-run";

// Metadata paths need at least one segment; component paths may be empty.
#[allow(clippy::expect_used)]
static PRE_RUN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$(?:(pre-run-md)((?::[^:]+)+)|(pre-run-cpt)((?::[^:]+)*))$")
        .expect("pre-run pattern is valid")
});

#[allow(clippy::expect_used)]
static POST_RUN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$post-run(?::([A-Za-z0-9_-]+))?$").expect("post-run pattern is valid")
});

/// Where a schema value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// Nested key path into the device's static metadata.
    PreRunMetadata { path: Vec<String> },
    /// Sub-component path of the device, read live when the run starts.
    PreRunComponent { path: Vec<String> },
    /// Component recorded in the run's documents; empty path is the device itself.
    PostRunComponent { path: Vec<String> },
}

impl Placeholder {
    /// Parse a raw schema string. Returns `None` for literals.
    pub fn parse(raw: &str) -> Option<Placeholder> {
        if !raw.starts_with('$') {
            return None;
        }

        if let Some(caps) = POST_RUN_PATTERN.captures(raw) {
            let path = caps
                .get(1)
                .map(|m| vec![m.as_str().to_string()])
                .unwrap_or_default();
            return Some(Placeholder::PostRunComponent { path });
        }

        let caps = PRE_RUN_PATTERN.captures(raw)?;
        let (prefix, segments) = match (caps.get(1), caps.get(3)) {
            (Some(prefix), _) => (prefix.as_str(), caps.get(2)),
            (None, Some(prefix)) => (prefix.as_str(), caps.get(4)),
            (None, None) => return None,
        };
        let path: Vec<String> = segments
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split(':')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();

        match prefix {
            PRE_RUN_MD_PREFIX => Some(Placeholder::PreRunMetadata { path }),
            PRE_RUN_CPT_PREFIX => Some(Placeholder::PreRunComponent { path }),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Placeholder::PreRunMetadata { .. } => PRE_RUN_MD_PREFIX,
            Placeholder::PreRunComponent { .. } => PRE_RUN_CPT_PREFIX,
            Placeholder::PostRunComponent { .. } => POST_RUN_PREFIX,
        }
    }

    pub fn path(&self) -> &[String] {
        match self {
            Placeholder::PreRunMetadata { path }
            | Placeholder::PreRunComponent { path }
            | Placeholder::PostRunComponent { path } => path,
        }
    }

    /// Resolved when the run starts (as opposed to when it stops).
    pub fn is_pre_run(&self) -> bool {
        !matches!(self, Placeholder::PostRunComponent { .. })
    }

    /// Key under which a post-run component appears in the run's documents.
    ///
    /// Devices flatten sub-component names into `<device><delimiter><component>`;
    /// an empty path designates the device's own readback, named after the device.
    pub fn document_key(&self, device: &str, delimiter: &str) -> String {
        let path = self.path();
        if path.is_empty() {
            device.to_string()
        } else {
            format!("{}{}{}", device, delimiter, path.join(delimiter))
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.prefix())?;
        for segment in self.path() {
            write!(f, ":{}", segment)?;
        }
        Ok(())
    }
}
