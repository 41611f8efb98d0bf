//! Plain data shared between the bridge and the code that drives it.
//!
//! Nothing in here talks to an engine; these are the values that cross the
//! JNI boundary in both directions, in their Rust shape.

use serde::{Deserialize, Serialize};

/// One prior conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn is_system(&self) -> bool {
        self.role.eq_ignore_ascii_case("system")
    }
}

/// Element type of a tensor.
///
/// On the wire the type is packed as `(code << 8) | bits`, where code is
/// 0 = signed int, 1 = unsigned int, 2 = float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Int32,
}

impl DataType {
    const CODE_INT: i32 = 0;
    const CODE_FLOAT: i32 = 2;

    pub fn from_raw(raw: i32) -> Option<Self> {
        match (raw >> 8, raw & 0xFF) {
            (Self::CODE_FLOAT, 32) => Some(DataType::Float32),
            (Self::CODE_INT, 32) => Some(DataType::Int32),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            DataType::Float32 => (Self::CODE_FLOAT << 8) | 32,
            DataType::Int32 => (Self::CODE_INT << 8) | 32,
        }
    }
}

/// Memory layout tag carried alongside a tensor's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionFormat {
    Nhwc,
    Nc4hw4,
    Nchw,
}

impl DimensionFormat {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DimensionFormat::Nhwc),
            1 => Some(DimensionFormat::Nc4hw4),
            2 => Some(DimensionFormat::Nchw),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            DimensionFormat::Nhwc => 0,
            DimensionFormat::Nc4hw4 => 1,
            DimensionFormat::Nchw => 2,
        }
    }
}

/// Requested compute backend for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardType {
    Cpu,
    Metal,
    Cuda,
    OpenCl,
    Auto,
    OpenGl,
    Vulkan,
}

impl ForwardType {
    /// Unknown codes fall back to `Auto`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ForwardType::Cpu,
            1 => ForwardType::Metal,
            2 => ForwardType::Cuda,
            3 => ForwardType::OpenCl,
            6 => ForwardType::OpenGl,
            7 => ForwardType::Vulkan,
            _ => ForwardType::Auto,
        }
    }

    pub fn wants_gpu(self) -> bool {
        !matches!(self, ForwardType::Cpu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Normal,
    High,
    Low,
}

impl Precision {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Precision::High,
            2 => Precision::Low,
            _ => Precision::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    #[default]
    Normal,
    High,
    Low,
}

impl MemoryMode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => MemoryMode::High,
            2 => MemoryMode::Low,
            _ => MemoryMode::Normal,
        }
    }
}

/// How a module should be scheduled by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub forward_type: ForwardType,
    /// 0 lets the engine pick.
    pub num_threads: u32,
    pub precision: Precision,
    pub memory: MemoryMode,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            forward_type: ForwardType::Cpu,
            num_threads: 0,
            precision: Precision::Normal,
            memory: MemoryMode::Normal,
        }
    }
}
