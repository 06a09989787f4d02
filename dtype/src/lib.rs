//! Element types and memory spaces shared by every polygpu crate.
//!
//! Kept deliberately flat: the scheduler only needs byte and bit widths for
//! buffer sizing and vectorization factors, and the memory-space tag for
//! naming promoted buffers.

#[cfg(test)]
pub mod test;

/// Scalar element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::EnumString, strum::Display)]
#[cfg_attr(any(test, feature = "proptest"), derive(proptest_derive::Arbitrary))]
#[strum(serialize_all = "lowercase")]
pub enum ScalarDType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl ScalarDType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn bits(&self) -> usize {
        self.bytes() * 8
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_int(&self) -> bool {
        !self.is_float() && !matches!(self, Self::Bool)
    }
}

/// Memory space a buffer lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumIter, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MemType {
    /// Device global memory.
    #[default]
    Global,
    /// Per-block shared memory.
    Shared,
    /// Per-thread registers / local memory.
    Local,
}

impl MemType {
    /// Suffix appended to a tensor name when it is promoted into this space.
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::Global => "",
            Self::Shared => "_shared",
            Self::Local => "_local",
        }
    }

    /// Storage scope string attached to realize statements.
    pub const fn scope(&self) -> &'static str {
        match self {
            Self::Global => "",
            Self::Shared => "shared",
            Self::Local => "local",
        }
    }

    /// Name of the promoted copy of `tensor`.
    pub fn promoted_name(&self, tensor: &str) -> String {
        format!("{tensor}{}", self.suffix())
    }

    /// Whether `name` carries an on-chip promotion suffix.
    pub fn is_promoted_name(name: &str) -> bool {
        name.ends_with(Self::Shared.suffix()) || name.ends_with(Self::Local.suffix())
    }
}
