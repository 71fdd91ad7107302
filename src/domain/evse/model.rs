//! EVSE hardware state

use serde::Serialize;

/// The four boolean attributes reported by an EVSE status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EvseFlag {
    EvConnected,
    ChargingEnabled,
    Charging,
    Error,
}

impl EvseFlag {
    /// Order in which flags appear in a status reply.
    pub const ALL: [EvseFlag; 4] = [
        EvseFlag::EvConnected,
        EvseFlag::ChargingEnabled,
        EvseFlag::Charging,
        EvseFlag::Error,
    ];
}

/// Direction of a boolean transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Edge {
    /// 0 → 1
    Rising,
    /// 1 → 0
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub evse_id: i32,
    pub flag: EvseFlag,
    pub edge: Edge,
}

/// A parsed status reply. `None` means the field could not be read and
/// the current value is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub ev_connected: Option<bool>,
    pub charging_enabled: Option<bool>,
    pub charging: Option<bool>,
    pub in_error: Option<bool>,
}

impl StatusReport {
    pub fn get(&self, flag: EvseFlag) -> Option<bool> {
        match flag {
            EvseFlag::EvConnected => self.ev_connected,
            EvseFlag::ChargingEnabled => self.charging_enabled,
            EvseFlag::Charging => self.charging,
            EvseFlag::Error => self.in_error,
        }
    }
}

/// A parsed meter reply. Unreadable fields are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterReport {
    pub energy_active_net_wh: Option<i64>,
    pub power_active_import_w: Option<i64>,
}

/// Latest readings of one EVSE. Only the owning connector mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvseState {
    pub id: i32,
    pub ev_connected: bool,
    pub charging_enabled: bool,
    pub charging: bool,
    pub in_error: bool,
    pub energy_active_net_wh: i64,
    pub power_active_import_w: i64,
}

impl EvseState {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn flag(&self, flag: EvseFlag) -> bool {
        match flag {
            EvseFlag::EvConnected => self.ev_connected,
            EvseFlag::ChargingEnabled => self.charging_enabled,
            EvseFlag::Charging => self.charging,
            EvseFlag::Error => self.in_error,
        }
    }

    fn flag_mut(&mut self, flag: EvseFlag) -> &mut bool {
        match flag {
            EvseFlag::EvConnected => &mut self.ev_connected,
            EvseFlag::ChargingEnabled => &mut self.charging_enabled,
            EvseFlag::Charging => &mut self.charging,
            EvseFlag::Error => &mut self.in_error,
        }
    }

    /// Apply a status reply and return the edges it produced, in reply
    /// field order. Repeating the current value yields no edge.
    pub fn apply_status(&mut self, report: &StatusReport) -> Vec<EdgeEvent> {
        let mut edges = Vec::new();
        for flag in EvseFlag::ALL {
            let Some(reported) = report.get(flag) else {
                continue;
            };
            let current = self.flag_mut(flag);
            if *current == reported {
                continue;
            }
            *current = reported;
            edges.push(EdgeEvent {
                evse_id: self.id,
                flag,
                edge: if reported { Edge::Rising } else { Edge::Falling },
            });
        }
        edges
    }

    pub fn apply_meter(&mut self, report: &MeterReport) {
        if let Some(wh) = report.energy_active_net_wh {
            self.energy_active_net_wh = wh;
        }
        if let Some(w) = report.power_active_import_w {
            self.power_active_import_w = w;
        }
    }

    pub fn energy_active_net_kwh(&self) -> f64 {
        self.energy_active_net_wh as f64 / 1000.0
    }

    pub fn power_active_import_kw(&self) -> f64 {
        self.power_active_import_w as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(ev: bool, enabled: bool, charging: bool, error: bool) -> StatusReport {
        StatusReport {
            ev_connected: Some(ev),
            charging_enabled: Some(enabled),
            charging: Some(charging),
            in_error: Some(error),
        }
    }

    #[test]
    fn repeated_status_produces_no_edges() {
        let mut state = EvseState::new(1);
        let first = state.apply_status(&status(true, false, false, false));
        assert_eq!(first.len(), 1);
        for _ in 0..3 {
            assert!(state.apply_status(&status(true, false, false, false)).is_empty());
        }
    }

    #[test]
    fn edges_follow_field_order() {
        let mut state = EvseState::new(2);
        let edges = state.apply_status(&status(true, true, true, false));
        let flags: Vec<_> = edges.iter().map(|e| e.flag).collect();
        assert_eq!(
            flags,
            vec![EvseFlag::EvConnected, EvseFlag::ChargingEnabled, EvseFlag::Charging]
        );
        assert!(edges.iter().all(|e| e.edge == Edge::Rising && e.evse_id == 2));

        let edges = state.apply_status(&status(false, true, true, false));
        assert_eq!(
            edges,
            vec![EdgeEvent {
                evse_id: 2,
                flag: EvseFlag::EvConnected,
                edge: Edge::Falling
            }]
        );
    }

    #[test]
    fn unreadable_fields_are_kept() {
        let mut state = EvseState::new(0);
        state.apply_status(&status(true, true, false, false));
        let edges = state.apply_status(&StatusReport {
            ev_connected: None,
            charging_enabled: Some(false),
            charging: None,
            in_error: None,
        });
        assert_eq!(edges.len(), 1);
        assert!(state.ev_connected);
        assert!(!state.charging_enabled);

        state.apply_meter(&MeterReport {
            energy_active_net_wh: Some(1500),
            power_active_import_w: Some(7200),
        });
        state.apply_meter(&MeterReport {
            energy_active_net_wh: None,
            power_active_import_w: Some(0),
        });
        assert_eq!(state.energy_active_net_wh, 1500);
        assert_eq!(state.power_active_import_w, 0);
        assert!((state.energy_active_net_kwh() - 1.5).abs() < f64::EPSILON);
    }
}
