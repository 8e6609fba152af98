use thiserror::Error;

/// Conditions that end the run with a user-facing message rather than a bug report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Fatal {
    #[error("IOMMU Disabled in UEFI/BIOS and/or not enabled in boot arguments!")]
    IommuDisabled,
    #[error("No non-bridge devices matched; bridges have no vendor:device or address token to print")]
    BridgeOnly,
}
