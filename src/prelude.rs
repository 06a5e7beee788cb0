pub use std::path::{Path, PathBuf};

pub use anyhow::{anyhow, bail, Context, Result};
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::error::CacheError;
