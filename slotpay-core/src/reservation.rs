use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Instructor,
    Vehicle,
    Room,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instructor => "instructor",
            ResourceKind::Vehicle => "vehicle",
            ResourceKind::Room => "room",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instructor" => Ok(ResourceKind::Instructor),
            "vehicle" => Ok(ResourceKind::Vehicle),
            "room" => Ok(ResourceKind::Room),
            other => Err(CoreError::ValidationError(format!("unknown resource kind: {other}"))),
        }
    }
}

/// A bookable entity (instructor, vehicle, room) scoped to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Resource {
    pub id: String,
    pub tenant_id: String,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn new(tenant_id: impl Into<String>, id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            kind,
        }
    }
}

/// Half-open interval `[start, end)` on a resource's calendar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Slot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CoreResult<Self> {
        let slot = Self { start, end };
        slot.validate()?;
        Ok(slot)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.start >= self.end {
            return Err(CoreError::ValidationError(format!(
                "slot start {} must be before end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Touching intervals (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Confirmed,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Held and confirmed reservations occupy the calendar.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Held | ReservationStatus::Confirmed)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(ReservationStatus::Held),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "expired" => Ok(ReservationStatus::Expired),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(CoreError::ValidationError(format!("unknown reservation status: {other}"))),
        }
    }
}

/// Time-bounded exclusive claim on a resource's calendar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: String,
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    pub slot: Slot,
    pub holder_id: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only set while `status == Held`.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Fails when `now + ttl` is past the representable range.
    pub fn hold(
        resource: &Resource,
        slot: Slot,
        holder_id: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> CoreResult<Self> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| CoreError::ValidationError(format!("hold of {}s is out of range", ttl.num_seconds())))?;
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: resource.tenant_id.clone(),
            resource_id: resource.id.clone(),
            resource_kind: resource.kind,
            slot,
            holder_id,
            status: ReservationStatus::Held,
            created_at: now,
            updated_at: now,
            expires_at: Some(expires_at),
        })
    }

    pub fn same_resource(&self, other: &Reservation) -> bool {
        self.tenant_id == other.tenant_id && self.resource_id == other.resource_id
    }

    /// Whether this reservation prevents `other` from being held.
    pub fn blocks(&self, other: &Reservation) -> bool {
        self.same_resource(other) && self.status.is_active() && self.slot.overlaps(&other.slot)
    }

    /// A hold is lapsed once `now` is strictly past `expires_at`.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && self.expires_at.is_some_and(|at| now > at)
    }

    pub fn update_status(&mut self, status: ReservationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if status != ReservationStatus::Held {
            self.expires_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_slot_rejects_empty_interval() {
        assert!(Slot::new(at(10, 0), at(10, 0)).is_err());
        assert!(Slot::new(at(11, 0), at(10, 0)).is_err());
        assert!(Slot::new(at(10, 0), at(10, 45)).is_ok());
    }

    #[test]
    fn test_slot_overlap_is_half_open() {
        let lesson = Slot::new(at(10, 0), at(10, 45)).unwrap();
        let next = Slot::new(at(10, 45), at(11, 30)).unwrap();
        let straddling = Slot::new(at(10, 30), at(11, 0)).unwrap();

        assert!(!lesson.overlaps(&next));
        assert!(!next.overlaps(&lesson));
        assert!(lesson.overlaps(&straddling));
        assert!(straddling.overlaps(&next));
    }

    #[test]
    fn test_hold_sets_expiry_and_blocks_overlap() {
        let resource = Resource::new("t1", "r1", ResourceKind::Vehicle);
        let slot = Slot::new(at(10, 0), at(10, 45)).unwrap();
        let held = Reservation::hold(&resource, slot, "h1".into(), at(9, 0), Duration::seconds(300)).unwrap();

        assert_eq!(held.expires_at, Some(at(9, 5)));
        assert!(!held.is_lapsed(at(9, 5)));
        assert!(held.is_lapsed(at(9, 6)));

        let other = Reservation::hold(&resource, slot, "h2".into(), at(9, 0), Duration::seconds(300)).unwrap();
        assert!(held.blocks(&other));

        let elsewhere = Reservation::hold(&Resource::new("t1", "r2", ResourceKind::Vehicle), slot, "h3".into(), at(9, 0), Duration::seconds(300)).unwrap();
        assert!(!held.blocks(&elsewhere));
    }

    #[test]
    fn test_hold_rejects_ttl_past_the_calendar() {
        let resource = Resource::new("t1", "r1", ResourceKind::Room);
        let slot = Slot::new(at(10, 0), at(10, 45)).unwrap();
        let result = Reservation::hold(&resource, slot, "h1".into(), at(9, 0), Duration::days(365 * 300_000));
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }

    #[test]
    fn test_leaving_held_clears_expiry() {
        let resource = Resource::new("t1", "r1", ResourceKind::Room);
        let slot = Slot::new(at(10, 0), at(10, 45)).unwrap();
        let mut reservation = Reservation::hold(&resource, slot, "h1".into(), at(9, 0), Duration::seconds(60)).unwrap();
        reservation.update_status(ReservationStatus::Confirmed, at(9, 0));
        assert_eq!(reservation.expires_at, None);
        assert!(reservation.status.is_active());
    }
}
