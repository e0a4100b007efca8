//! License oracle seam. Pricing and entitlement logic live in an external
//! collaborator; the hub only consults the derived limits.

/// Limits the hub derives from the active license tier.
pub trait LicenseOracle: Send + Sync {
    /// How long sensor history is kept in the retention sink.
    fn retention_days(&self) -> u32;

    /// Maximum concurrently registered agents, if the tier caps them.
    fn max_agents(&self) -> Option<usize>;
}

/// Built-in community tier used when no license collaborator is wired in.
pub struct CommunityLicense;

impl LicenseOracle for CommunityLicense {
    fn retention_days(&self) -> u32 {
        7
    }

    fn max_agents(&self) -> Option<usize> {
        None
    }
}
