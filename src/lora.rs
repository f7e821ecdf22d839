//! Motion LoRA descriptors.
//!
//! A motion LoRA is a low-rank additive delta over a motion module's weights.
//! The descriptors here identify a loaded delta and its blend strength; the
//! actual merge happens in [`crate::adjust`].

use serde::{Deserialize, Serialize};

/// One LoRA delta: its asset name, blend strength, and content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionLoRAInfo {
    /// Asset name the delta was loaded under.
    pub name: String,
    /// Multiplier applied to the delta during the merge.
    pub strength: f32,
    /// Content hash reported by the loader, for cache keys and provenance.
    pub content_hash: String,
}

impl MotionLoRAInfo {
    /// Describe a loaded LoRA delta.
    pub fn new(name: impl Into<String>, strength: f32, content_hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strength,
            content_hash: content_hash.into(),
        }
    }
}

/// Ordered list of LoRA deltas; list order is application order.
///
/// Cloning is structural, so a caller can extend a list without mutating one
/// shared upstream:
///
/// ```
/// use animotion_burn::lora::{MotionLoRAInfo, MotionLoRAList};
///
/// let mut base = MotionLoRAList::new();
/// base.add_lora(MotionLoRAInfo::new("pan_left", 1.0, "abc123"));
///
/// let mut extended = base.clone();
/// extended.add_lora(MotionLoRAInfo::new("zoom_in", 0.6, "def456"));
/// assert_eq!(base.len(), 1);
/// assert_eq!(extended.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionLoRAList {
    loras: Vec<MotionLoRAInfo>,
}

impl MotionLoRAList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a LoRA; it will be applied after every existing entry.
    pub fn add_lora(&mut self, lora: MotionLoRAInfo) {
        self.loras.push(lora);
    }

    /// Iterate the entries in application order.
    pub fn iter(&self) -> std::slice::Iter<'_, MotionLoRAInfo> {
        self.loras.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.loras.len()
    }

    /// Whether the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.loras.is_empty()
    }
}

impl<'a> IntoIterator for &'a MotionLoRAList {
    type Item = &'a MotionLoRAInfo;
    type IntoIter = std::slice::Iter<'a, MotionLoRAInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.loras.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_independent() {
        let mut base = MotionLoRAList::new();
        base.add_lora(MotionLoRAInfo::new("a", 1.0, "h1"));

        let mut extended = base.clone();
        extended.add_lora(MotionLoRAInfo::new("b", 0.5, "h2"));

        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
    }

    #[test]
    fn order_is_preserved() {
        let mut list = MotionLoRAList::new();
        list.add_lora(MotionLoRAInfo::new("first", 1.0, "h1"));
        list.add_lora(MotionLoRAInfo::new("second", 0.25, "h2"));

        let names: Vec<&str> = list.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
