//! Internal utilities.
//!
//! - [`arena`]: generational slot arena backing machine identity
//! - [`det_rng`]: deterministic PRNG used by strategies and the production
//!   runtime's nondeterministic-choice surface
//! - [`det_hash`]: deterministic hashing for program-state fingerprints

pub mod arena;
pub mod det_hash;
pub mod det_rng;

pub use arena::{Arena, ArenaIndex};
pub use det_hash::{DetBuildHasher, DetHasher};
pub use det_rng::DetRng;
