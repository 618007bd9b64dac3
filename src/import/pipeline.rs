// Import pipeline
// One run per file: lock -> run record -> parse -> per-row upsert with an
// audit row for every source row. Row failures never stop the run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use rusqlite::Connection;
use serde::Serialize;

use super::lock::ImportLock;
use crate::clock::{format_timestamp, Clock};
use crate::constants::{
    DEFAULT_LOCK_TTL_SECONDS, MAPPING_TYPE_SPECIALTY, ROW_ERROR_MAX_LEN, ROW_STATUS_ERROR, ROW_STATUS_SKIPPED,
    ROW_STATUS_SUCCESS, RUN_STATUS_COMPLETED, RUN_STATUS_FAILED,
};
use crate::db::schema::{self, DoctorFields, ImportCounters, NewImportRow};
use crate::error::{panic_message, DocrateError, Result};
use crate::parser::{
    detect_column_mapping, file_name, CanonicalField, ColumnMapping, FormatRegistry, ParseOptions, ParsedRow,
};
use crate::sanitize::{self, mask_phone, FieldType};
use crate::settings::SettingsStore;

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub path: PathBuf,
    /// Insurance company the file came from.
    pub source: String,
    pub options: ParseOptions,
    /// Explicit column mapping. `None` detects it from the headers.
    pub mapping: Option<ColumnMapping>,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            options: ParseOptions::default(),
            mapping: None,
        }
    }

    /// Same settings for another file (directory batches).
    pub fn for_file(&self, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: i64,
    pub source: String,
    pub file: String,
    pub status: String,
    pub counters: ImportCounters,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub mapping: ColumnMapping,
}

impl ImportSummary {
    pub fn success_count(&self) -> i64 {
        self.counters.success_count()
    }

    pub fn is_completed(&self) -> bool {
        self.status == RUN_STATUS_COMPLETED
    }

    /// Turn a failed run into an error for callers that want one.
    pub fn ensure_completed(&self) -> Result<&Self> {
        if self.is_completed() {
            return Ok(self);
        }
        Err(DocrateError::RunAborted {
            run_id: self.run_id,
            message: self.error_message.clone().unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

/// Identity used to match an incoming row to an existing doctor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NaturalKey {
    License(String),
    NameCity { first_name: String, last_name: String, city: String },
}

impl NaturalKey {
    fn of(doctor: &DoctorFields) -> Self {
        if doctor.license_number.is_empty() {
            NaturalKey::NameCity {
                first_name: doctor.first_name.clone(),
                last_name: doctor.last_name.clone(),
                city: doctor.city.clone(),
            }
        } else {
            NaturalKey::License(doctor.license_number.clone())
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RowOutcome {
    Created(i64),
    Updated(i64),
}

impl RowOutcome {
    fn doctor_id(&self) -> i64 {
        match self {
            RowOutcome::Created(id) | RowOutcome::Updated(id) => *id,
        }
    }
}

/// One sanitized, mapped row ready to persist.
struct PreparedRow {
    doctor: DoctorFields,
    specialty: String,
}

fn field_types() -> HashMap<String, FieldType> {
    CanonicalField::ALL
        .into_iter()
        .map(|f| (f.as_str().to_string(), f.field_type()))
        .collect()
}

fn truncate(message: &str) -> String {
    message.chars().take(ROW_ERROR_MAX_LEN).collect()
}

pub struct Importer<'a> {
    conn: &'a Connection,
    settings: &'a dyn SettingsStore,
    clock: &'a dyn Clock,
    registry: FormatRegistry,
    lock_ttl_seconds: i64,
}

impl<'a> Importer<'a> {
    pub fn new(conn: &'a Connection, settings: &'a dyn SettingsStore, clock: &'a dyn Clock) -> Self {
        Self {
            conn,
            settings,
            clock,
            registry: FormatRegistry::default(),
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
        }
    }

    pub fn with_lock_ttl(mut self, ttl_seconds: i64) -> Self {
        self.lock_ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    /// Run one import. Returns a summary for runs that complete and for runs
    /// that cannot start (lock or parse failure). `Err` means the run broke
    /// off midway; its record is marked failed before returning.
    pub fn run(&self, request: &ImportRequest) -> Result<ImportSummary> {
        let file = file_name(&request.path);
        let lock = ImportLock::new(self.settings, self.clock).with_ttl(self.lock_ttl_seconds);

        // Released when dropped, on every exit path including unwinding
        let _held = match lock.hold(&request.source) {
            Ok(held) => held,
            Err(e) => {
                if !matches!(e, DocrateError::AlreadyLocked { .. } | DocrateError::LockFailed(_)) {
                    return Err(e);
                }
                log::warn!("Import of {} from {} not started: {}", file, request.source, e);
                let run_id = schema::insert_import_run(self.conn, &request.source, &file)?;
                schema::finish_import_run(self.conn, run_id, RUN_STATUS_FAILED, Some(&e.to_string()), &self.now())?;
                return Ok(self.summary(run_id, request, &file, ColumnMapping::new(), Some(&e)));
            }
        };

        self.run_locked(request, &file)
    }

    fn run_locked(&self, request: &ImportRequest, file: &str) -> Result<ImportSummary> {
        let run_id = schema::insert_import_run(self.conn, &request.source, file)?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process(run_id, request, file)
        }));

        let failure = match result {
            Ok(Ok(summary)) => return Ok(summary),
            Ok(Err(e)) => e,
            Err(panic) => DocrateError::RunAborted {
                run_id,
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            },
        };

        log::error!("Import run {} broke off: {}", run_id, failure);
        if let Err(e) = schema::finish_import_run(
            self.conn,
            run_id,
            RUN_STATUS_FAILED,
            Some(&failure.to_string()),
            &self.now(),
        ) {
            log::error!("Failed to mark import run {} failed: {}", run_id, e);
        }
        Err(failure)
    }

    fn process(&self, run_id: i64, request: &ImportRequest, file: &str) -> Result<ImportSummary> {
        schema::mark_import_running(self.conn, run_id, &self.now())?;
        log::info!("Import run {} started: {} from {}", run_id, file, request.source);

        let parsed = match self.registry.parse(&request.path, &request.options) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("Import run {} failed to parse {}: {}", run_id, file, e);
                schema::finish_import_run(self.conn, run_id, RUN_STATUS_FAILED, Some(&e.to_string()), &self.now())?;
                return Ok(self.summary(run_id, request, file, ColumnMapping::new(), Some(&e)));
            }
        };

        let mapping = request
            .mapping
            .clone()
            .unwrap_or_else(|| detect_column_mapping(&parsed.headers));
        for required in [CanonicalField::FirstName, CanonicalField::LastName] {
            if mapping.get(required).is_none() {
                log::warn!("Import run {}: no column mapped to {}", run_id, required);
            }
        }

        let types = field_types();
        let mut counters = ImportCounters {
            total_rows: parsed.rows.len() as i64,
            ..Default::default()
        };
        schema::update_import_counters(self.conn, run_id, &counters)?;

        // natural key -> (first source row, doctor id)
        let mut seen: HashMap<NaturalKey, (usize, i64)> = HashMap::new();

        for row in &parsed.rows {
            let raw_data = serde_json::to_string(&row.fields)?;

            let prepared = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                prepare_row(row, &mapping, &types)
            }))
            .unwrap_or_else(|panic| {
                Err(DocrateError::Row(format!("Row processing panicked: {}", panic_message(panic.as_ref()))))
            });

            let prepared = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.record_row(run_id, row, ROW_STATUS_ERROR, None, Some(&e.to_string()), &raw_data)?;
                    counters.error_count += 1;
                    counters.processed_rows += 1;
                    schema::update_import_counters(self.conn, run_id, &counters)?;
                    continue;
                }
            };

            let key = NaturalKey::of(&prepared.doctor);
            if let Some((first_row, doctor_id)) = seen.get(&key) {
                let note = format!("Duplicate of source row {}", first_row);
                self.record_row(run_id, row, ROW_STATUS_SKIPPED, Some(*doctor_id), Some(&note), &raw_data)?;
                counters.skipped_count += 1;
                counters.processed_rows += 1;
                schema::update_import_counters(self.conn, run_id, &counters)?;
                continue;
            }

            // Process one row (catch panics so one bad row never kills the run)
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.persist_row(run_id, &request.source, file, row, &prepared, &raw_data)
            }));

            let failure = match result {
                Ok(Ok(outcome)) => {
                    match outcome {
                        RowOutcome::Created(_) => counters.new_count += 1,
                        RowOutcome::Updated(_) => counters.updated_count += 1,
                    }
                    seen.insert(key, (row.row_number, outcome.doctor_id()));
                    log::debug!(
                        "Import run {} row {}: {:?} (phone {})",
                        run_id,
                        row.row_number,
                        outcome,
                        mask_phone(&prepared.doctor.phone)
                    );
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("Row processing panicked: {}", panic_message(panic.as_ref()))),
            };

            if let Some(message) = failure {
                log::warn!("Import run {} row {} failed: {}", run_id, row.row_number, message);
                self.record_row(run_id, row, ROW_STATUS_ERROR, None, Some(&message), &raw_data)?;
                counters.error_count += 1;
            }

            counters.processed_rows += 1;
            schema::update_import_counters(self.conn, run_id, &counters)?;
        }

        schema::finish_import_run(self.conn, run_id, RUN_STATUS_COMPLETED, None, &self.now())?;
        log::info!(
            "Import run {} completed: {} processed, {} new, {} updated, {} errors, {} skipped",
            run_id,
            counters.processed_rows,
            counters.new_count,
            counters.updated_count,
            counters.error_count,
            counters.skipped_count
        );

        Ok(self.summary(run_id, request, file, mapping, None))
    }

    /// Upsert the doctor, link specialty and arrangement, and append the
    /// success row, all in one transaction.
    fn persist_row(
        &self,
        run_id: i64,
        source: &str,
        file: &str,
        row: &ParsedRow,
        prepared: &PreparedRow,
        raw_data: &str,
    ) -> Result<RowOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let doctor = &prepared.doctor;

        let existing = if doctor.license_number.is_empty() {
            schema::find_doctor_by_name_city(&tx, &doctor.first_name, &doctor.last_name, &doctor.city)?
        } else {
            schema::find_doctor_by_license(&tx, &doctor.license_number)?
        };

        let outcome = match existing {
            Some(found) => {
                schema::update_doctor_non_empty(&tx, found.id, doctor)?;
                RowOutcome::Updated(found.id)
            }
            None => RowOutcome::Created(schema::insert_doctor(&tx, doctor)?),
        };
        let doctor_id = outcome.doctor_id();

        if !prepared.specialty.is_empty() {
            let normalized = schema::lookup_mapping(&tx, MAPPING_TYPE_SPECIALTY, &prepared.specialty)?;
            schema::link_specialty(&tx, doctor_id, &prepared.specialty, normalized.as_deref(), source)?;
        }

        schema::upsert_arrangement(&tx, doctor_id, source, file, run_id, &self.now())?;

        schema::insert_import_row(&tx, &NewImportRow {
            import_id: run_id,
            source_row: row.row_number as i64,
            status: ROW_STATUS_SUCCESS,
            doctor_id: Some(doctor_id),
            error_message: None,
            raw_data,
        })?;

        tx.commit()?;
        Ok(outcome)
    }

    fn record_row(
        &self,
        run_id: i64,
        row: &ParsedRow,
        status: &str,
        doctor_id: Option<i64>,
        message: Option<&str>,
        raw_data: &str,
    ) -> Result<()> {
        let message = message.map(truncate);
        schema::insert_import_row(self.conn, &NewImportRow {
            import_id: run_id,
            source_row: row.row_number as i64,
            status,
            doctor_id,
            error_message: message.as_deref(),
            raw_data,
        })?;
        Ok(())
    }

    fn summary(
        &self,
        run_id: i64,
        request: &ImportRequest,
        file: &str,
        mapping: ColumnMapping,
        error: Option<&DocrateError>,
    ) -> ImportSummary {
        let (status, counters) = match schema::get_import_run(self.conn, run_id) {
            Ok(Some(run)) => (
                run.status,
                ImportCounters {
                    total_rows: run.total_rows,
                    processed_rows: run.processed_rows,
                    new_count: run.new_count,
                    updated_count: run.updated_count,
                    error_count: run.error_count,
                    skipped_count: run.skipped_count,
                },
            ),
            _ => (RUN_STATUS_FAILED.to_string(), ImportCounters::default()),
        };

        ImportSummary {
            run_id,
            source: request.source.clone(),
            file: file.to_string(),
            status,
            counters,
            error_code: error.map(|e| e.code().to_string()),
            error_message: error.map(|e| e.to_string()),
            mapping,
        }
    }

    /// Import several files, one run each. A file that cannot be imported is
    /// reported and the batch moves on.
    pub fn run_batch(&self, files: &[PathBuf], template: &ImportRequest) -> Vec<BatchItem> {
        files
            .iter()
            .map(|path| {
                let outcome = self.run(&template.for_file(path)).map_err(|e| BatchError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
                BatchItem {
                    file: path.clone(),
                    outcome,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub file: PathBuf,
    pub outcome: std::result::Result<ImportSummary, BatchError>,
}

/// Map, sanitize and validate one raw row.
fn prepare_row(
    row: &ParsedRow,
    mapping: &ColumnMapping,
    types: &HashMap<String, FieldType>,
) -> Result<PreparedRow> {
    let mapped = mapping.apply(&row.fields);
    let clean: BTreeMap<String, String> = sanitize::row(&mapped, types);
    let value = |field: CanonicalField| clean.get(field.as_str()).cloned().unwrap_or_default();

    let doctor = DoctorFields {
        license_number: value(CanonicalField::LicenseNumber),
        first_name: value(CanonicalField::FirstName),
        last_name: value(CanonicalField::LastName),
        phone: value(CanonicalField::Phone),
        email: value(CanonicalField::Email),
        city: value(CanonicalField::City),
        address: value(CanonicalField::Address),
    };

    let missing: Vec<&str> = [
        (CanonicalField::FirstName, &doctor.first_name),
        (CanonicalField::LastName, &doctor.last_name),
    ]
    .into_iter()
    .filter(|(_, v)| v.is_empty())
    .map(|(f, _)| f.as_str())
    .collect();

    if !missing.is_empty() {
        return Err(DocrateError::Row(format!("Missing required field: {}", missing.join(", "))));
    }

    Ok(PreparedRow {
        specialty: value(CanonicalField::Specialty),
        doctor,
    })
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
