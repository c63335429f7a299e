use crate::error::{Error, Result};

/// Default key expression prefix for published snapshots.
pub const KEY_PREFIX: &str = "regpoll";

/// Kind of entity a snapshot key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Device,
    Collector,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Device => "device",
            SnapshotKind::Collector => "collector",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(SnapshotKind::Device),
            "collector" => Some(SnapshotKind::Collector),
            _ => None,
        }
    }
}

/// Builder for snapshot key expressions.
///
/// Keys follow `<prefix>/<device|collector>/<id>`; process-wide data lives
/// under `<prefix>/@/...`.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key for one device or collector snapshot.
    ///
    /// ```
    /// use regpoll_common::keyexpr::{KeyExprBuilder, SnapshotKind};
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(builder.entity(SnapshotKind::Device, "meter"), "regpoll/device/meter");
    /// ```
    pub fn entity(&self, kind: SnapshotKind, id: &str) -> String {
        format!("{}/{}/{}", self.prefix, kind.as_str(), sanitize_segment(id))
    }

    /// Key for the traffic counters.
    pub fn traffic(&self) -> String {
        format!("{}/@/traffic", self.prefix)
    }

    /// Key for the poller status.
    pub fn status(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Wildcard matching every snapshot under the prefix.
    pub fn wildcard(&self) -> String {
        format!("{}/**", self.prefix)
    }
}

/// Replace characters that zenoh reserves in key expressions.
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '*' | '$' | '?' | '#' | '@' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// A parsed entity key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyExpr {
    pub kind: SnapshotKind,
    pub id: String,
}

/// Parse `<prefix>/<device|collector>/<id>`.
pub fn parse_key_expr(prefix: &str, key: &str) -> Result<ParsedKeyExpr> {
    let rest = key
        .strip_prefix(prefix.trim_end_matches('/'))
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| Error::KeyExpr(format!("'{}' is not under prefix '{}'", key, prefix)))?;

    let (kind, id) = rest
        .split_once('/')
        .ok_or_else(|| Error::KeyExpr(format!("Missing entity id in '{}'", key)))?;

    let kind = SnapshotKind::parse(kind)
        .ok_or_else(|| Error::KeyExpr(format!("Unknown entity kind '{}' in '{}'", kind, key)))?;

    if id.is_empty() || id.contains('/') {
        return Err(Error::KeyExpr(format!("Invalid entity id in '{}'", key)));
    }

    Ok(ParsedKeyExpr {
        kind,
        id: id.to_string(),
    })
}
