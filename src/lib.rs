//! This library is the storage core of a distributed component manager: a
//! content-addressed object store plus a versioned component graph.
//!
//! Open an existing scope as follows:
//!
//! ```rust,no_run
//! use rbit::scope::{Remotes, Scope};
//!
//! let scope = Scope::load("path/to/scope", Remotes::new());
//! ```

pub mod scope;
