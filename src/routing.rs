//! Channel-to-sink routing table.
//!
//! The table is built once at startup from the configured route lines and is
//! read-only afterwards, so it can be shared between tasks behind an `Arc`
//! without locking.

use crate::core::Sink;
use crate::error::{BridgeError, Result};
use std::collections::{BTreeSet, HashMap};

/// One `(channel, sink)` association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub channel: String,
    pub sink: Sink,
}

impl RouteEntry {
    pub fn new(channel: impl Into<String>, sink: Sink) -> Self {
        Self {
            channel: channel.into(),
            sink,
        }
    }

    /// Parses a route line of the form `"<channel> <sink>"`.
    ///
    /// The first whitespace-delimited token is the channel and the trimmed
    /// remainder is the sink descriptor.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (channel, rest) = match line.split_once(char::is_whitespace) {
            Some((channel, rest)) => (channel, rest.trim()),
            None => (line, ""),
        };

        if channel.is_empty() || rest.is_empty() {
            return Err(BridgeError::config(format!(
                "route '{}' must have the form '<channel> <sink>'",
                line
            )));
        }

        Ok(Self::new(channel, Sink::parse(rest)?))
    }
}

/// Maps each channel to the ordered list of sinks registered for it.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<Sink>>,
}

impl RouteTable {
    /// Groups entries by channel, keeping sinks in insertion order.
    ///
    /// Duplicate `(channel, sink)` pairs are kept; each one produces its own
    /// delivery. Fails if no entry is given.
    pub fn build<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = RouteEntry>,
    {
        let mut routes: HashMap<String, Vec<Sink>> = HashMap::new();
        for entry in entries {
            routes.entry(entry.channel).or_default().push(entry.sink);
        }

        if routes.is_empty() {
            return Err(BridgeError::config("no routes configured"));
        }
        Ok(Self { routes })
    }

    /// Parses raw route lines and builds the table.
    ///
    /// The first malformed line aborts construction.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                RouteEntry::parse(line.as_ref()).map_err(|e| match e {
                    BridgeError::Config(msg) => {
                        BridgeError::Config(format!("routes[{}]: {}", i, msg))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::build(entries)
    }

    /// Returns the sinks for `channel`, or an empty slice if none are registered.
    pub fn sinks_for(&self, channel: &str) -> &[Sink] {
        self.routes.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The distinct channels to subscribe to.
    pub fn channels(&self) -> BTreeSet<String> {
        self.routes.keys().cloned().collect()
    }

    /// Total number of routes across all channels.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
