//! Natural-key identity: which fields identify a record, the run-scoped
//! resolution cache, and resolution against a destination.

pub mod cache;
pub mod registry;
pub mod resolver;

pub use cache::{CacheKey, CacheStats, Checkpoint, ResolutionCache, SourceIdMap};
pub use registry::{KeyOrigin, KeyPlan, NaturalKeyRegistry, NaturalKeySpec, FALLBACK_PRIORITY};
pub use resolver::{PackageIndex, ResolveError, Resolver};
