//! Reasons an update pass can be requested for.
//!
//! Carried through the trigger API and logged with each pass so traces can
//! attribute attribute churn to its source event.

use std::fmt;

/// The event that triggered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OomAdjReason {
    None,
    Activity,
    FinishReceiver,
    StartReceiver,
    BindService,
    UnbindService,
    StartService,
    StopService,
    ExecutingService,
    GetProvider,
    RemoveProvider,
    UiVisibility,
    Allowlist,
    ProcessBegin,
    ProcessEnd,
    ShortFgsTimeout,
    SystemInit,
    Backup,
    Shell,
    RemoveTask,
    UidIdle,
    RestrictionChange,
    ComponentDisabled,
    FollowUp,
    Reconfiguration,
    ServiceBinderCall,
}

impl OomAdjReason {
    /// Stable identifier used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            OomAdjReason::None => "none",
            OomAdjReason::Activity => "activity",
            OomAdjReason::FinishReceiver => "finish-receiver",
            OomAdjReason::StartReceiver => "start-receiver",
            OomAdjReason::BindService => "bind-service",
            OomAdjReason::UnbindService => "unbind-service",
            OomAdjReason::StartService => "start-service",
            OomAdjReason::StopService => "stop-service",
            OomAdjReason::ExecutingService => "executing-service",
            OomAdjReason::GetProvider => "get-provider",
            OomAdjReason::RemoveProvider => "remove-provider",
            OomAdjReason::UiVisibility => "ui-visibility",
            OomAdjReason::Allowlist => "allowlist",
            OomAdjReason::ProcessBegin => "process-begin",
            OomAdjReason::ProcessEnd => "process-end",
            OomAdjReason::ShortFgsTimeout => "short-fgs-timeout",
            OomAdjReason::SystemInit => "system-init",
            OomAdjReason::Backup => "backup",
            OomAdjReason::Shell => "shell",
            OomAdjReason::RemoveTask => "remove-task",
            OomAdjReason::UidIdle => "uid-idle",
            OomAdjReason::RestrictionChange => "restriction-change",
            OomAdjReason::ComponentDisabled => "component-disabled",
            OomAdjReason::FollowUp => "follow-up",
            OomAdjReason::Reconfiguration => "reconfiguration",
            OomAdjReason::ServiceBinderCall => "service-binder-call",
        }
    }
}

impl fmt::Display for OomAdjReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
