//! Session entity

use sea_orm::entity::prelude::*;

use crate::domain::ChargingSession;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub backend_id: String,

    /// Charger-reported transaction id (proxy-assigned for 1.6).
    #[sea_orm(nullable)]
    pub charger_tx_id: Option<String>,

    pub start_meter_wh: i64,

    #[sea_orm(nullable)]
    pub stop_meter_wh: Option<i64>,

    /// Most recent interim meter reading.
    #[sea_orm(nullable)]
    pub last_meter_wh: Option<i64>,

    pub started_at: DateTimeUtc,

    #[sea_orm(nullable)]
    pub stopped_at: Option<DateTimeUtc>,

    #[sea_orm(nullable)]
    pub stop_reason: Option<String>,

    /// Energy delivered in Wh, computed at close from the stop meter.
    #[sea_orm(nullable)]
    pub energy_wh: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ChargingSession {
    fn from(m: Model) -> Self {
        ChargingSession {
            id: m.id as i64,
            backend_id: m.backend_id,
            charger_tx_id: m.charger_tx_id,
            start_meter_wh: m.start_meter_wh,
            stop_meter_wh: m.stop_meter_wh,
            last_meter_wh: m.last_meter_wh,
            started_at: m.started_at,
            stopped_at: m.stopped_at,
            stop_reason: m.stop_reason,
        }
    }
}
