//! Index selections along the time, z and channel axes.
//!
//! A [`Selection`] is what the job parameters say (`"all"`, `"2"`,
//! `"0,3-5"`); [`Selection::resolve`] turns it into concrete indices for
//! an axis of known length, and [`IndexMap`] records where each selected
//! index lands in the output volume.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Which indices of one axis to process.
///
/// Explicit selections are kept as sorted, merged inclusive ranges, so a
/// range is never expanded before it meets the axis length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every index.
    #[default]
    All,
    /// Disjoint, non-adjacent ranges in ascending order.
    Ranges(Vec<RangeInclusive<usize>>),
}

/// Error returned when a selection string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid index selection '{0}': expected \"all\", an index, a list, or a range")]
pub struct SelectionParseError(pub String);

impl Selection {
    /// Select a single index.
    #[must_use]
    pub fn single(index: usize) -> Self {
        Self::from_ranges(vec![index..=index])
    }

    /// Select the given indices.
    #[must_use]
    pub fn indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self::from_ranges(indices.into_iter().map(|i| i..=i).collect())
    }

    fn from_ranges(mut ranges: Vec<RangeInclusive<usize>>) -> Self {
        ranges.sort_unstable_by_key(|r| (*r.start(), *r.end()));
        let mut merged: Vec<RangeInclusive<usize>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(last) = merged.last_mut()
                && *range.start() <= last.end().saturating_add(1)
            {
                *last = *last.start()..=(*last.end()).max(*range.end());
            } else {
                merged.push(range);
            }
        }
        Self::Ranges(merged)
    }

    /// Parse a channel selection, where an empty or malformed value means
    /// the first channel only.
    #[must_use]
    pub fn channels_or_first(text: &str) -> Self {
        if text.trim().is_empty() {
            warn!("empty channel selection; using channel 0");
            return Self::single(0);
        }
        text.parse().unwrap_or_else(|e: SelectionParseError| {
            warn!(error = %e, "using channel 0");
            Self::single(0)
        })
    }

    /// Resolve the selection against an axis of length `len`.
    ///
    /// - [`Selection::All`] yields `0..len`.
    /// - Ranges keep their in-range indices, ascending; if none are in
    ///   range (an out-of-range single index, say) the result is `[0]`.
    ///
    /// The result is never empty. An axis of length 0 is treated as a
    /// synthetic axis of length 1.
    #[must_use]
    pub fn resolve(&self, len: usize) -> Vec<usize> {
        let len = len.max(1);
        match self {
            Self::All => (0..len).collect(),
            Self::Ranges(ranges) => {
                let last = len - 1;
                let kept: Vec<usize> = ranges
                    .iter()
                    .filter(|r| *r.start() <= last)
                    .flat_map(|r| *r.start()..=(*r.end()).min(last))
                    .collect();
                if kept.is_empty() { vec![0] } else { kept }
            }
        }
    }
}

impl FromStr for Selection {
    type Err = SelectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("all") || text == "*" {
            return Ok(Self::All);
        }

        let invalid = || SelectionParseError(s.to_owned());
        let mut ranges = Vec::new();
        for part in text.split(',').map(str::trim) {
            if let Some((start, end)) = part.split_once('-') {
                let start: usize = start.trim().parse().map_err(|_| invalid())?;
                let end: usize = end.trim().parse().map_err(|_| invalid())?;
                if end < start {
                    return Err(invalid());
                }
                ranges.push(start..=end);
            } else {
                let index: usize = part.parse().map_err(|_| invalid())?;
                ranges.push(index..=index);
            }
        }
        Ok(Self::from_ranges(ranges))
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Ranges(ranges) => {
                let parts: Vec<String> = ranges
                    .iter()
                    .map(|r| {
                        if r.start() == r.end() {
                            r.start().to_string()
                        } else {
                            format!("{}-{}", r.start(), r.end())
                        }
                    })
                    .collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Accepted JSON forms: `"all"`, `"0,2"`, `"1-3"`, `3`, `[0, 2]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Index(usize),
    List(Vec<usize>),
    Text(String),
}

impl Serialize for Selection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match SelectionRepr::deserialize(deserializer)? {
            SelectionRepr::Index(index) => Ok(Self::single(index)),
            SelectionRepr::List(indices) => Ok(Self::indices(indices)),
            SelectionRepr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Deserialize a channel selection with the fallback of
/// [`Selection::channels_or_first`].
///
/// # Errors
///
/// Only when the value is neither a number, a list, nor a string.
pub fn deserialize_channels<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Selection, D::Error> {
    Ok(match SelectionRepr::deserialize(deserializer)? {
        SelectionRepr::Index(index) => Selection::single(index),
        SelectionRepr::List(indices) => Selection::indices(indices),
        SelectionRepr::Text(text) => Selection::channels_or_first(&text),
    })
}

/// Mapping from original indices of one axis to output indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    selected: Vec<usize>,
    targets: Vec<Option<usize>>,
    output_len: usize,
}

impl IndexMap {
    /// Only selected indices occupy the output, in selection order.
    #[must_use]
    pub fn compact(selected: Vec<usize>, axis_len: usize) -> Self {
        let mut targets = vec![None; axis_len];
        for (out, &orig) in selected.iter().enumerate() {
            if let Some(slot) = targets.get_mut(orig) {
                *slot = Some(out);
            }
        }
        let output_len = selected.len();
        Self {
            selected,
            targets,
            output_len,
        }
    }

    /// The output keeps the full axis; selected indices map to themselves.
    #[must_use]
    pub fn identity(selected: Vec<usize>, axis_len: usize) -> Self {
        let mut targets = vec![None; axis_len];
        for &orig in &selected {
            if let Some(slot) = targets.get_mut(orig) {
                *slot = Some(orig);
            }
        }
        Self {
            selected,
            targets,
            output_len: axis_len,
        }
    }

    /// Original indices that will be processed.
    #[must_use]
    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    /// Output index for an original index, if it was selected.
    #[must_use]
    pub fn get(&self, original: usize) -> Option<usize> {
        self.targets.get(original).copied().flatten()
    }

    /// Length of this axis in the output volume.
    #[must_use]
    pub const fn output_len(&self) -> usize {
        self.output_len
    }
}
