//! SeaORM access to the sessions table
//!
//! `SessionStore` is shared in two roles: the session log actor uses it as
//! the sole writer, REST handlers use it as a read-only view.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use tracing::debug;

use crate::domain::{ChargingSession, SessionFilter, CSV_HEADER};
use crate::support::ProxyError;

use super::entity;

fn write_err(e: sea_orm::DbErr) -> ProxyError {
    ProxyError::LogWriteFailed(e.to_string())
}

#[derive(Clone)]
pub struct SessionStore {
    db: DatabaseConnection,
}

impl SessionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new open session and return its assigned id.
    pub async fn insert_open(
        &self,
        backend_id: &str,
        charger_tx_id: Option<&str>,
        start_meter_wh: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64, ProxyError> {
        let model = entity::ActiveModel {
            id: NotSet,
            backend_id: Set(backend_id.to_string()),
            charger_tx_id: Set(charger_tx_id.map(str::to_string)),
            start_meter_wh: Set(start_meter_wh),
            stop_meter_wh: Set(None),
            last_meter_wh: Set(None),
            started_at: Set(started_at),
            stopped_at: Set(None),
            stop_reason: Set(None),
            energy_wh: Set(None),
        };
        let inserted = model.insert(&self.db).await.map_err(write_err)?;
        debug!(session_id = inserted.id, backend_id, "session opened");
        Ok(inserted.id as i64)
    }

    pub async fn close(
        &self,
        session_id: i64,
        stop_meter_wh: i64,
        stopped_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<(), ProxyError> {
        let model = entity::Entity::find_by_id(session_id as i32)
            .one(&self.db)
            .await
            .map_err(write_err)?
            .ok_or(ProxyError::SessionNotFound(session_id))?;

        let energy = stop_meter_wh - model.start_meter_wh;
        let mut active: entity::ActiveModel = model.into();
        active.stop_meter_wh = Set(Some(stop_meter_wh));
        active.stopped_at = Set(Some(stopped_at));
        active.stop_reason = Set(reason.map(str::to_string));
        active.energy_wh = Set(Some(energy));
        active.update(&self.db).await.map_err(write_err)?;
        debug!(session_id, stop_meter_wh, "session closed");
        Ok(())
    }

    pub async fn record_meter(&self, session_id: i64, meter_wh: i64) -> Result<(), ProxyError> {
        let model = entity::Entity::find_by_id(session_id as i32)
            .one(&self.db)
            .await
            .map_err(write_err)?
            .ok_or(ProxyError::SessionNotFound(session_id))?;

        let mut active: entity::ActiveModel = model.into();
        active.last_meter_wh = Set(Some(meter_wh));
        active.update(&self.db).await.map_err(write_err)?;
        Ok(())
    }

    pub async fn find_by_id(&self, session_id: i64) -> Result<Option<ChargingSession>, ProxyError> {
        let model = entity::Entity::find_by_id(session_id as i32)
            .one(&self.db)
            .await
            .map_err(write_err)?;
        Ok(model.map(Into::into))
    }

    /// The single open session, if any.
    pub async fn find_open(&self) -> Result<Option<ChargingSession>, ProxyError> {
        let model = entity::Entity::find()
            .filter(entity::Column::StoppedAt.is_null())
            .order_by_desc(entity::Column::Id)
            .one(&self.db)
            .await
            .map_err(write_err)?;
        Ok(model.map(Into::into))
    }

    pub async fn list(&self, filter: &SessionFilter) -> Result<Vec<ChargingSession>, ProxyError> {
        let mut query = entity::Entity::find();
        if let Some(from) = filter.from {
            query = query.filter(entity::Column::StartedAt.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(entity::Column::StartedAt.lte(to));
        }
        if let Some(backend_id) = &filter.backend_id {
            query = query.filter(entity::Column::BackendId.eq(backend_id.clone()));
        }
        let models = query
            .order_by_asc(entity::Column::Id)
            .all(&self.db)
            .await
            .map_err(write_err)?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    /// CSV export with the stable column order of [`CSV_HEADER`].
    pub async fn export_csv(&self, filter: &SessionFilter) -> Result<String, ProxyError> {
        let sessions = self.list(filter).await?;
        let mut out = String::with_capacity(64 * (sessions.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for session in sessions {
            out.push_str(&session.csv_row());
            out.push('\n');
        }
        Ok(out)
    }
}
