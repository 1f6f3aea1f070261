//! Custom Resource Definitions
//!
//! The Widget CRD served by this operator and the kcp APIExport type it reads
//! at startup.

pub mod apiexport;
pub mod widget;

pub use apiexport::{ApiExport, ApiExportSpec, ApiExportStatus, Condition, VirtualWorkspace};
pub use widget::{Widget, WidgetSpec, WidgetStatus};
