pub mod cache;
pub mod detect;
pub mod filter;
pub mod fix;
pub mod report;

pub use cache::{CacheManager, CacheMode, WorkspaceState, CACHE_VERSION};
pub use detect::{
    engine::scan, LineIndex, Location, ScanContext, ScanOptions, ScanResult, ScanStats, Severity,
    ThreatCategory, ThreatReport, ThreatValidationError,
};
pub use filter::{filter_threats, FilterOptions, FilteredThreats, IgnoreRange};
pub use fix::{apply_fixes, sanitize, sanitize_strict, FixResult};
pub use report::{render_report, OutputFormat};
