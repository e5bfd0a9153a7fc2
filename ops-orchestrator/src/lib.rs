pub mod compose;

pub use compose::{Compose, ComposeFile, ComposePackage, ComposeReport, ComposeService};
