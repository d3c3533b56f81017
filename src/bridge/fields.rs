//! Endpoint groups and the table of writable fields.
//!
//! The table is the capability→topic mapping the bridge consumes: for each
//! writable field it names the command topic suffix, the device write route,
//! the key the route expects on the wire and the group whose remembered read
//! supplies fallback values.

use crate::config::{Bounds, LimitConfig};

/// Logical endpoint groups, one state document each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Live,
    Info,
    Injection,
    Boost,
}

impl Group {
    /// Suffix of the state topic.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Group::Live => "live",
            Group::Info => "info",
            Group::Injection => "get_injection",
            Group::Boost => "get_boost",
        }
    }

    pub fn read_route(&self) -> &'static str {
        match self {
            Group::Live => "live_values",
            Group::Info => "get_solmate_info",
            Group::Injection => "get_injection_settings",
            Group::Boost => "get_boost_injection",
        }
    }
}

/// Ordering constraint against the remembered value of a paired field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counterpart {
    /// Value must not exceed the remembered value of this field
    AtMost(&'static str),
    /// Value must not be below the remembered value of this field
    AtLeast(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    BoostWattage,
    BoostTime,
    UserMinimumInjection,
    UserMaximumInjection,
    UserMinimumBattery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritableField {
    /// Command topic suffix and key in the remembered group read
    pub name: &'static str,
    pub route: &'static str,
    pub wire_key: &'static str,
    pub group: Group,
    pub counterpart: Option<Counterpart>,
    limit: Limit,
}

impl WritableField {
    pub fn bounds(&self, limits: &LimitConfig) -> Bounds {
        match self.limit {
            Limit::BoostWattage => limits.boost_wattage,
            Limit::BoostTime => limits.boost_time,
            Limit::UserMinimumInjection => limits.user_minimum_injection,
            Limit::UserMaximumInjection => limits.user_maximum_injection,
            Limit::UserMinimumBattery => limits.user_minimum_battery_percentage,
        }
    }
}

pub const SET_BOOST_ROUTE: &str = "set_boost_injection";

pub const FIELDS: [WritableField; 5] = [
    WritableField {
        name: "set_wattage",
        route: SET_BOOST_ROUTE,
        wire_key: "wattage",
        group: Group::Boost,
        counterpart: None,
        limit: Limit::BoostWattage,
    },
    WritableField {
        name: "set_time",
        route: SET_BOOST_ROUTE,
        wire_key: "time",
        group: Group::Boost,
        counterpart: None,
        limit: Limit::BoostTime,
    },
    WritableField {
        name: "user_minimum_injection",
        route: "set_user_minimum_injection",
        wire_key: "injection",
        group: Group::Injection,
        counterpart: Some(Counterpart::AtMost("user_maximum_injection")),
        limit: Limit::UserMinimumInjection,
    },
    WritableField {
        name: "user_maximum_injection",
        route: "set_user_maximum_injection",
        wire_key: "injection",
        group: Group::Injection,
        counterpart: Some(Counterpart::AtLeast("user_minimum_injection")),
        limit: Limit::UserMaximumInjection,
    },
    WritableField {
        name: "user_minimum_battery_percentage",
        route: "set_user_minimum_battery_percentage",
        wire_key: "battery_percentage",
        group: Group::Injection,
        counterpart: None,
        limit: Limit::UserMinimumBattery,
    },
];

pub fn find(name: &str) -> Option<&'static WritableField> {
    FIELDS.iter().find(|f| f.name == name)
}

/// Fields that must be written together on one route.
pub fn route_fields(route: &str) -> impl Iterator<Item = &'static WritableField> + '_ {
    FIELDS.iter().filter(move |f| f.route == route)
}
