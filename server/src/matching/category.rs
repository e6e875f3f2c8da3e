use serde::{Deserialize, Serialize};
use std::fmt;

/// Category a device is classified into by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Male,
    Female,
    NonBinary,
    PreferNotToSay,
}

impl Category {
    /// All categories in bucket enumeration order.
    pub const ALL: [Category; 4] = [
        Category::Male,
        Category::Female,
        Category::NonBinary,
        Category::PreferNotToSay,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "non-binary" => Some(Self::NonBinary),
            "prefer-not-to-say" => Some(Self::PreferNotToSay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::NonBinary => "non-binary",
            Self::PreferNotToSay => "prefer-not-to-say",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join-time filter preference: a specific category or the `any` wildcard.
///
/// Serialized as a bare string (`"male"`, ..., `"any"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Only(Category),
    #[default]
    Any,
}

impl Filter {
    /// Number of queue buckets: one per category plus `any`.
    pub const BUCKETS: usize = 5;

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "any" => Some(Self::Any),
            other => Category::from_str(other).map(Self::Only),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Only(c) => c.as_str(),
            Self::Any => "any",
        }
    }

    /// The category this filter constrains to, if any.
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Only(c) => Some(*c),
            Self::Any => None,
        }
    }

    /// Bucket position: categories in declaration order, `any` last.
    pub(crate) fn bucket_index(&self) -> usize {
        match self {
            Self::Only(c) => c.index(),
            Self::Any => Self::BUCKETS - 1,
        }
    }

    /// Whether a candidate with `candidate` as stored category satisfies this filter.
    pub fn admits(&self, candidate: Option<Category>) -> bool {
        match self {
            Self::Any => true,
            Self::Only(wanted) => candidate == Some(*wanted),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Filter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Filter::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown filter: {s}")))
    }
}
