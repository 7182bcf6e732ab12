use clap::ValueEnum;

/// How strictly the user is held to finishing the update.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Cancelling aborts the download and keeps the application running
    #[default]
    Optional,
    /// The only way out of the download is quitting the application
    Mandatory,
}
