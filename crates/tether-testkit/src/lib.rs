//! Tether Testkit - Deterministic Test Infrastructure
//!
//! Substitutes for everything in `tether-effects` that depends on wall-clock
//! time, the filesystem or the host, plus helpers for the exhaustive
//! change-tracking protocol.
//!
//! ```ignore
//! let env = TestDependencies::new();
//! env.run(|| {
//!     let doc = Shared::persisted(FileKey::new("/doc.json"), Doc::default());
//!     doc.write(edited.clone());
//!     doc.assert(|doc| *doc = edited.clone());
//! });
//! env.advance(Duration::from_secs(1));
//! ```

#![forbid(unsafe_code)]

/// Isolated environment bundle
pub mod dependencies;

/// In-memory file storage
pub mod file_storage;

/// Issue capture helpers
pub mod issues;

/// Test logging
pub mod logging;

/// Virtual-clock scheduler
pub mod scheduler;

pub use dependencies::TestDependencies;
pub use file_storage::InMemoryFileStorage;
pub use issues::{expect_issue, expect_issues, IssueRecorder};
pub use logging::init_test_tracing;
pub use scheduler::TestScheduler;
