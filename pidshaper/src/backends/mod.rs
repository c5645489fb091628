// Backend trait definitions and core types

pub mod divert;
pub mod focus;
pub mod process;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but limited (shelling out to helper tools)
    Good = 2,     // Solid implementation
    Better = 3,   // Modern, efficient
    Best = 4,     // Native kernel / OS APIs
}
