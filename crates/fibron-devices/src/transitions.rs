//! Lifecycle transition map.
//!
//! A pure table mapping a (previous, current) device state pair to the
//! ordered list of handlers the device manager must run. Rows are keyed on
//! the (admin, oper, connect) tuples of both sides with wildcard slots;
//! the first matching row wins and an unchanged state tuple matches
//! nothing.

use std::fmt;

use fibron_core::device::{AdminState, ConnectStatus, Device, OperStatus};

/// Handler identifiers executed by the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionHandler {
    CreateLogicalDevice,
    SetupUniLogicalPorts,
    DeleteLogicalDevice,
    DeleteLogicalPort,
    DisableAllChildDevices,
    DeleteAllChildDevices,
    ActivateDevice,
    DisableDevice,
    ReEnableDevice,
    Abandon,
    NoOp,
    /// The update driving this transition must be rejected. Always the only
    /// handler in its row.
    NotAllowed,
}

impl fmt::Display for TransitionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateLogicalDevice => "create_logical_device",
            Self::SetupUniLogicalPorts => "setup_uni_logical_ports",
            Self::DeleteLogicalDevice => "delete_logical_device",
            Self::DeleteLogicalPort => "delete_logical_port",
            Self::DisableAllChildDevices => "disable_all_child_devices",
            Self::DeleteAllChildDevices => "delete_all_child_devices",
            Self::ActivateDevice => "activate_device",
            Self::DisableDevice => "disable_device",
            Self::ReEnableDevice => "re_enable_device",
            Self::Abandon => "abandon_device",
            Self::NoOp => "no_op",
            Self::NotAllowed => "not_allowed",
        };
        f.write_str(name)
    }
}

/// One side of a transition row; `None` slots match any value.
#[derive(Debug, Clone, Copy, Default)]
struct StatePattern {
    admin: Option<AdminState>,
    oper: Option<OperStatus>,
    connect: Option<ConnectStatus>,
}

impl StatePattern {
    fn admin(admin: AdminState) -> Self {
        Self {
            admin: Some(admin),
            ..Default::default()
        }
    }

    fn admin_oper(admin: AdminState, oper: OperStatus) -> Self {
        Self {
            admin: Some(admin),
            oper: Some(oper),
            connect: None,
        }
    }

    fn matches(&self, device: &Device) -> bool {
        self.admin.is_none_or(|a| a == device.admin_state)
            && self.oper.is_none_or(|o| o == device.oper_status)
            && self.connect.is_none_or(|c| c == device.connect_status)
    }
}

struct Transition {
    previous: StatePattern,
    current: StatePattern,
    handlers: Vec<TransitionHandler>,
}

/// Ordered transition table.
pub struct TransitionMap {
    transitions: Vec<Transition>,
}

impl TransitionMap {
    pub fn new() -> Self {
        use AdminState::*;
        use OperStatus::*;
        use TransitionHandler::*;

        let mut transitions = Vec::new();
        let mut add = |previous: StatePattern, current: StatePattern, handlers: Vec<_>| {
            transitions.push(Transition {
                previous,
                current,
                handlers,
            });
        };

        // Deleted is terminal; leaving it is rejected outright.
        add(
            StatePattern::admin(Deleted),
            StatePattern::admin(Enabled),
            vec![NotAllowed],
        );
        add(
            StatePattern::admin(Deleted),
            StatePattern::admin(Disabled),
            vec![NotAllowed],
        );
        add(
            StatePattern::admin(Deleted),
            StatePattern::admin(Preprovisioned),
            vec![NotAllowed],
        );

        // First activation.
        add(
            StatePattern::admin(Preprovisioned),
            StatePattern::admin(Enabled),
            vec![ActivateDevice],
        );

        // The adapter reported the device up; realize it logically.
        add(
            StatePattern::admin_oper(Enabled, Activating),
            StatePattern::admin_oper(Enabled, Active),
            vec![CreateLogicalDevice, SetupUniLogicalPorts],
        );
        add(
            StatePattern::admin_oper(Enabled, Discovered),
            StatePattern::admin_oper(Enabled, Active),
            vec![CreateLogicalDevice, SetupUniLogicalPorts],
        );

        add(
            StatePattern::admin(Enabled),
            StatePattern::admin(Disabled),
            vec![DisableDevice, DisableAllChildDevices],
        );
        add(
            StatePattern::admin(Disabled),
            StatePattern::admin(Enabled),
            vec![ReEnableDevice],
        );

        // Tear-down chains. The logical-device and logical-port handlers
        // guard on the root flag, so one row serves both sides of the tree.
        add(
            StatePattern::admin(Preprovisioned),
            StatePattern::admin(Deleted),
            vec![Abandon],
        );
        add(
            StatePattern::admin(Enabled),
            StatePattern::admin(Deleted),
            vec![
                DeleteLogicalDevice,
                DeleteLogicalPort,
                DeleteAllChildDevices,
                Abandon,
            ],
        );
        add(
            StatePattern::admin(Disabled),
            StatePattern::admin(Deleted),
            vec![
                DeleteLogicalDevice,
                DeleteLogicalPort,
                DeleteAllChildDevices,
                Abandon,
            ],
        );

        Self { transitions }
    }

    /// The ordered handler list for a state change, or `None` when the
    /// change needs no action. An identical state tuple is always a no-op.
    pub fn lookup(&self, previous: &Device, current: &Device) -> Option<&[TransitionHandler]> {
        if previous.same_state(current) {
            return None;
        }
        self.transitions
            .iter()
            .find(|t| t.previous.matches(previous) && t.current.matches(current))
            .map(|t| t.handlers.as_slice())
    }

    /// Whether the state change is rejected by the table.
    pub fn is_allowed(&self, previous: &Device, current: &Device) -> bool {
        !self
            .lookup(previous, current)
            .is_some_and(|handlers| handlers.contains(&TransitionHandler::NotAllowed))
    }
}

impl Default for TransitionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_in(admin: AdminState, oper: OperStatus) -> Device {
        let mut device = Device::new("dev-1", "ponsim_olt");
        device.admin_state = admin;
        device.oper_status = oper;
        device
    }

    #[test]
    fn test_identity_is_noop() {
        let map = TransitionMap::new();
        let d = device_in(AdminState::Enabled, OperStatus::Active);
        assert!(map.lookup(&d, &d).is_none());
    }

    #[test]
    fn test_activation_chain() {
        let map = TransitionMap::new();
        let prev = device_in(AdminState::Enabled, OperStatus::Activating);
        let curr = device_in(AdminState::Enabled, OperStatus::Active);
        let handlers = map.lookup(&prev, &curr).unwrap();
        assert_eq!(
            handlers,
            &[
                TransitionHandler::CreateLogicalDevice,
                TransitionHandler::SetupUniLogicalPorts
            ]
        );
    }

    #[test]
    fn test_deleted_is_terminal() {
        let map = TransitionMap::new();
        let prev = device_in(AdminState::Deleted, OperStatus::Unknown);
        let curr = device_in(AdminState::Enabled, OperStatus::Unknown);
        let handlers = map.lookup(&prev, &curr).unwrap();
        assert_eq!(handlers, &[TransitionHandler::NotAllowed]);
        assert!(!map.is_allowed(&prev, &curr));
    }

    #[test]
    fn test_delete_chain_order() {
        let map = TransitionMap::new();
        let prev = device_in(AdminState::Enabled, OperStatus::Active);
        let curr = device_in(AdminState::Deleted, OperStatus::Unknown);
        let handlers = map.lookup(&prev, &curr).unwrap();
        assert_eq!(
            handlers,
            &[
                TransitionHandler::DeleteLogicalDevice,
                TransitionHandler::DeleteLogicalPort,
                TransitionHandler::DeleteAllChildDevices,
                TransitionHandler::Abandon,
            ]
        );
    }

    #[test]
    fn test_oper_only_change_without_row_is_noop() {
        let map = TransitionMap::new();
        let prev = device_in(AdminState::Enabled, OperStatus::Active);
        let mut curr = prev.clone();
        curr.connect_status = ConnectStatus::Unreachable;
        assert!(map.lookup(&prev, &curr).is_none());
        assert!(map.is_allowed(&prev, &curr));
    }

    #[test]
    fn test_handler_names() {
        assert_eq!(
            TransitionHandler::CreateLogicalDevice.to_string(),
            "create_logical_device"
        );
        assert_eq!(TransitionHandler::NotAllowed.to_string(), "not_allowed");
    }
}
