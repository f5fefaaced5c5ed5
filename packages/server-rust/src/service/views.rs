//! View scopes and materialization of view tables from replication.

use std::collections::BTreeSet;

use tabledex_core::ddl;
use tabledex_core::view::{
    build_table_view_crc32_sql, create_select_insert_from_entity_replication,
    determine_cause_of_exception, SCOPE_PARAMETER,
};
use tabledex_core::{ColumnModel, DbValue, ViewTypeMask};

use super::availability::AvailabilityCoordinator;
use super::context::TableContext;
use crate::error::TableError;
use crate::traits::Params;

/// Records view scopes and rebuilds view tables from the replicated
/// entity and annotation rows.
#[derive(Clone)]
pub struct ViewMaterializer {
    ctx: TableContext,
    availability: AvailabilityCoordinator,
}

impl ViewMaterializer {
    #[must_use]
    pub fn new(ctx: TableContext) -> Self {
        let availability = AvailabilityCoordinator::new(ctx.clone());
        Self { ctx, availability }
    }

    /// Replaces the whole scope and type of a view, then starts a rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] when the view does not exist.
    pub async fn set_view_scope_and_type(
        &self,
        view_id: i64,
        container_ids: &BTreeSet<i64>,
        view_type: ViewTypeMask,
    ) -> Result<(), TableError> {
        self.availability.get_table_type(view_id).await?;
        self.ctx
            .scope_store
            .set_view_scope_and_type(view_id, container_ids, view_type)
            .await?;
        tracing::info!(
            view_id,
            containers = container_ids.len(),
            view_type = view_type.bits(),
            "view scope replaced"
        );
        self.availability
            .set_table_to_processing_and_trigger_update(view_id)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the scope store fails.
    pub async fn get_view_scope(&self, view_id: i64) -> Result<BTreeSet<i64>, TableError> {
        Ok(self.ctx.scope_store.get_view_scope(view_id).await?)
    }

    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the scope store fails.
    pub async fn get_view_type(&self, view_id: i64) -> Result<Option<ViewTypeMask>, TableError> {
        Ok(self.ctx.scope_store.get_view_type(view_id).await?)
    }

    /// Views whose scope holds any of the containers on `path_ids`, i.e. the
    /// views affected by a change below those containers.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the scope store fails.
    pub async fn find_view_scope_intersection_with_path(
        &self,
        path_ids: &BTreeSet<i64>,
    ) -> Result<BTreeSet<i64>, TableError> {
        Ok(self
            .ctx
            .scope_store
            .find_view_scope_intersection_with_path(path_ids)
            .await?)
    }

    /// Empties the view table and refills it from the replicated rows in the
    /// view's expanded scope. Returns the number of rows inserted.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Validation`] naming the column when an
    /// annotation value does not fit it, [`TableError::Internal`] for other
    /// failures.
    pub async fn populate_view(&self, view_id: i64, schema: &[ColumnModel]) -> Result<u64, TableError> {
        let view_type = self
            .ctx
            .scope_store
            .get_view_type(view_id)
            .await?
            .ok_or_else(|| TableError::Validation(format!("View {view_id} has no type")))?;
        let containers = self
            .availability
            .get_all_container_ids_for_view_scope(view_id)
            .await?;

        self.ctx
            .index
            .update(&ddl::truncate_table_sql(view_id), &Params::new())
            .await?;
        if containers.is_empty() {
            return Ok(0);
        }

        let sql = create_select_insert_from_entity_replication(view_id, view_type, schema);
        let params = Params::from([(
            SCOPE_PARAMETER.to_string(),
            DbValue::LongList(containers.iter().copied().collect()),
        )]);
        tracing::debug!(view_id, sql = %sql, "populating view");
        match self.ctx.index.update(&sql, &params).await {
            Ok(rows) => {
                tracing::info!(view_id, rows, "view populated");
                Ok(rows)
            }
            Err(e) => {
                let annotations = self
                    .ctx
                    .truth
                    .annotation_columns(view_type, &containers)
                    .await?;
                determine_cause_of_exception(schema, &annotations)?;
                Err(TableError::Internal(e))
            }
        }
    }

    /// Checksum of the rows currently in the view table; -1 when empty.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Internal`] when the query fails.
    pub async fn view_table_checksum(&self, view_id: i64) -> Result<i64, TableError> {
        Ok(self
            .ctx
            .index
            .query_long(&build_table_view_crc32_sql(view_id), &Params::new())
            .await?
            .unwrap_or(-1))
    }
}
