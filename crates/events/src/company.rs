use kardex_core::CompanyId;

/// Helper trait for company-scoped messages.
///
/// The notification bus routes every message to the topic of the company it
/// belongs to; anything published on the bus must say which company that is.
pub trait CompanyScoped {
    fn company_id(&self) -> CompanyId;
}
