//! Custom Resource Definitions for the fencing operator

mod remediation_config;
mod remediation_request;
mod remediation_template;
pub mod types;

#[cfg(test)]
mod tests;

pub use remediation_config::{
    RemediationConfig, RemediationConfigSpec, Settings, CONFIG_CR_NAME,
    DEFAULT_SAFE_REBOOT_TIMEOUT_SECONDS, DEFAULT_WATCHDOG_PATH,
};
pub use remediation_request::{
    RemediationPhase, RemediationRequest, RemediationRequestSpec, RemediationRequestStatus,
    RemediationStrategy,
};
pub use remediation_template::{
    ensure_default_template, RemediationTemplate, RemediationTemplateResource,
    RemediationTemplateSpec, RESOURCE_DELETION_TEMPLATE_NAME,
};
pub use types::Condition;
