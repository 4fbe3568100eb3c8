//! Planning-application lead sync.
//!
//! Candidates are pulled from the planning source for each client's criteria,
//! de-duplicated against the client's stored leads, keyword-filtered, enriched
//! with agent detail, and pushed into the client's CRM one at a time. Every
//! invocation leaves a [`SyncRun`] in the run log.

pub mod delivery;
pub mod domain;
pub mod repository;
pub mod router;
pub mod service;
pub mod source;

#[cfg(test)]
mod tests;

pub use delivery::{
    application_type_tag, iso_week_tag, ContactPayload, CrmGateway, CustomField, DeliveryError,
    LeadConnectorClient, FALLBACK_CONTACT_NAME, SOURCE_TAG,
};
pub use domain::{
    new_id, ClientAccount, ClientId, CrmCredentials, Lead, LeadId, RunId, SyncCriteria, SyncRun,
};
pub use repository::{
    client_overviews, sync_stats, ClientOverview, RepositoryError, SyncRepository, SyncStats,
};
pub use router::{sync_router, ClientUpsert, CriteriaInput};
pub use service::{lookback_days, Clock, SyncService, SyncSettings, SystemClock};
pub use source::{
    retry_after, ApplicationDetail, ApplicationSource, DetailLookup, DetailSource,
    PaginationSettings, PlanItClient, PlanningCandidate, SourceError, PAGE_SIZE,
};
