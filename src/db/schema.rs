// Database schema types and query helpers

use rusqlite::{Connection, params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::constants::{MAPPING_TYPES, RUN_STATUS_PENDING, RUN_STATUS_RUNNING};
use crate::error::{DocrateError, Result};

// ----- Doctors -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: i64,
    pub license_number: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Sanitized doctor values from one import row. Empty strings mean "no value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctorFields {
    pub license_number: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub city: String,
    pub address: String,
}

const DOCTOR_COLUMNS: &str =
    "id, license_number, first_name, last_name, phone, email, city, address, created_at, updated_at";

fn map_doctor(row: &rusqlite::Row) -> rusqlite::Result<Doctor> {
    Ok(Doctor {
        id: row.get(0)?,
        license_number: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        phone: row.get(4)?,
        email: row.get(5)?,
        city: row.get(6)?,
        address: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

pub fn insert_doctor(conn: &Connection, doctor: &DoctorFields) -> Result<i64> {
    conn.execute(
        "INSERT INTO doctors (license_number, first_name, last_name, phone, email, city, address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            non_empty(&doctor.license_number),
            doctor.first_name,
            doctor.last_name,
            non_empty(&doctor.phone),
            non_empty(&doctor.email),
            non_empty(&doctor.city),
            non_empty(&doctor.address),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite only the columns for which the import row carries a value.
pub fn update_doctor_non_empty(conn: &Connection, id: i64, doctor: &DoctorFields) -> Result<()> {
    conn.execute(
        "UPDATE doctors SET
            license_number = COALESCE(?1, license_number),
            first_name = COALESCE(?2, first_name),
            last_name = COALESCE(?3, last_name),
            phone = COALESCE(?4, phone),
            email = COALESCE(?5, email),
            city = COALESCE(?6, city),
            address = COALESCE(?7, address),
            updated_at = datetime('now')
         WHERE id = ?8",
        params![
            non_empty(&doctor.license_number),
            non_empty(&doctor.first_name),
            non_empty(&doctor.last_name),
            non_empty(&doctor.phone),
            non_empty(&doctor.email),
            non_empty(&doctor.city),
            non_empty(&doctor.address),
            id,
        ],
    )?;
    Ok(())
}

pub fn get_doctor(conn: &Connection, id: i64) -> Result<Option<Doctor>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM doctors WHERE id = ?1", DOCTOR_COLUMNS),
        params![id],
        map_doctor,
    ).optional()?;
    Ok(result)
}

pub fn find_doctor_by_license(conn: &Connection, license_number: &str) -> Result<Option<Doctor>> {
    let result = conn.query_row(
        &format!(
            "SELECT {} FROM doctors WHERE license_number = ?1 AND deleted_at IS NULL
             ORDER BY id ASC LIMIT 1",
            DOCTOR_COLUMNS
        ),
        params![license_number],
        map_doctor,
    ).optional()?;
    Ok(result)
}

/// Fallback identity for rows without a license number.
pub fn find_doctor_by_name_city(conn: &Connection, first_name: &str, last_name: &str, city: &str) -> Result<Option<Doctor>> {
    let result = conn.query_row(
        &format!(
            "SELECT {} FROM doctors
             WHERE first_name = ?1 AND last_name = ?2 AND COALESCE(city, '') = ?3
               AND deleted_at IS NULL
             ORDER BY id ASC LIMIT 1",
            DOCTOR_COLUMNS
        ),
        params![first_name, last_name, city],
        map_doctor,
    ).optional()?;
    Ok(result)
}

pub fn count_doctors(conn: &Connection) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM doctors WHERE deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ----- Specialties -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specialty {
    pub id: i64,
    pub doctor_id: i64,
    pub source_specialty: String,
    pub normalized_specialty: Option<String>,
    pub source_company: String,
}

/// Link a specialty to a doctor once per (doctor, source value, company).
pub fn link_specialty(
    conn: &Connection,
    doctor_id: i64,
    source_specialty: &str,
    normalized_specialty: Option<&str>,
    source_company: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO specialties (doctor_id, source_specialty, normalized_specialty, source_company)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(doctor_id, source_specialty, source_company) DO UPDATE SET
            normalized_specialty = COALESCE(excluded.normalized_specialty, specialties.normalized_specialty)",
        params![doctor_id, source_specialty, normalized_specialty, source_company],
    )?;
    Ok(())
}

pub fn list_doctor_specialties(conn: &Connection, doctor_id: i64) -> Result<Vec<Specialty>> {
    let mut stmt = conn.prepare(
        "SELECT id, doctor_id, source_specialty, normalized_specialty, source_company
         FROM specialties WHERE doctor_id = ?1 ORDER BY id ASC"
    )?;

    let specialties = stmt.query_map(params![doctor_id], |row| {
        Ok(Specialty {
            id: row.get(0)?,
            doctor_id: row.get(1)?,
            source_specialty: row.get(2)?,
            normalized_specialty: row.get(3)?,
            source_company: row.get(4)?,
        })
    })?.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(specialties)
}

// ----- Arrangements -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arrangement {
    pub id: i64,
    pub doctor_id: i64,
    pub insurance_company: String,
    pub source_file: Option<String>,
    pub import_id: Option<i64>,
    pub updated_at: String,
}

/// One live arrangement per (doctor, insurer); a re-import refreshes its provenance.
pub fn upsert_arrangement(
    conn: &Connection,
    doctor_id: i64,
    insurance_company: &str,
    source_file: &str,
    import_id: i64,
    imported_at: &str,
) -> Result<i64> {
    let existing: Option<i64> = conn.query_row(
        "SELECT id FROM arrangements
         WHERE doctor_id = ?1 AND insurance_company = ?2 AND deleted_at IS NULL
         ORDER BY id ASC LIMIT 1",
        params![doctor_id, insurance_company],
        |row| row.get(0),
    ).optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE arrangements SET source_file = ?1, import_id = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![source_file, import_id, imported_at, id],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO arrangements (doctor_id, insurance_company, source_file, import_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![doctor_id, insurance_company, source_file, import_id, imported_at],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

pub fn list_doctor_arrangements(conn: &Connection, doctor_id: i64) -> Result<Vec<Arrangement>> {
    let mut stmt = conn.prepare(
        "SELECT id, doctor_id, insurance_company, source_file, import_id, updated_at
         FROM arrangements WHERE doctor_id = ?1 AND deleted_at IS NULL ORDER BY id ASC"
    )?;

    let arrangements = stmt.query_map(params![doctor_id], |row| {
        Ok(Arrangement {
            id: row.get(0)?,
            doctor_id: row.get(1)?,
            insurance_company: row.get(2)?,
            source_file: row.get(3)?,
            import_id: row.get(4)?,
            updated_at: row.get(5)?,
        })
    })?.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(arrangements)
}

// ----- Import runs -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRun {
    pub id: i64,
    pub source: String,
    pub filename: Option<String>,
    pub status: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl ImportRun {
    pub fn success_count(&self) -> i64 {
        self.new_count + self.updated_count
    }
}

/// Running totals for one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounters {
    pub total_rows: i64,
    pub processed_rows: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
}

impl ImportCounters {
    pub fn success_count(&self) -> i64 {
        self.new_count + self.updated_count
    }
}

const IMPORT_RUN_COLUMNS: &str =
    "id, source, filename, status, total_rows, processed_rows, new_count, updated_count,
     error_count, skipped_count, error_message, started_at, completed_at, created_at";

fn map_import_run(row: &rusqlite::Row) -> rusqlite::Result<ImportRun> {
    Ok(ImportRun {
        id: row.get(0)?,
        source: row.get(1)?,
        filename: row.get(2)?,
        status: row.get(3)?,
        total_rows: row.get(4)?,
        processed_rows: row.get(5)?,
        new_count: row.get(6)?,
        updated_count: row.get(7)?,
        error_count: row.get(8)?,
        skipped_count: row.get(9)?,
        error_message: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        created_at: row.get(13)?,
    })
}

/// Create a run in `pending` state.
pub fn insert_import_run(conn: &Connection, source: &str, filename: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO import_logs (source, filename, status) VALUES (?1, ?2, ?3)",
        params![source, filename, RUN_STATUS_PENDING],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn mark_import_running(conn: &Connection, id: i64, started_at: &str) -> Result<()> {
    conn.execute(
        "UPDATE import_logs SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
        params![RUN_STATUS_RUNNING, started_at, id, RUN_STATUS_PENDING],
    )?;
    Ok(())
}

pub fn update_import_counters(conn: &Connection, id: i64, counters: &ImportCounters) -> Result<()> {
    conn.execute(
        "UPDATE import_logs SET total_rows = ?1, processed_rows = ?2, new_count = ?3,
            updated_count = ?4, error_count = ?5, skipped_count = ?6
         WHERE id = ?7",
        params![
            counters.total_rows,
            counters.processed_rows,
            counters.new_count,
            counters.updated_count,
            counters.error_count,
            counters.skipped_count,
            id,
        ],
    )?;
    Ok(())
}

/// Move a run to a terminal state. Terminal runs are never touched again.
pub fn finish_import_run(
    conn: &Connection,
    id: i64,
    status: &str,
    error_message: Option<&str>,
    completed_at: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE import_logs SET status = ?1, error_message = ?2, completed_at = ?3,
            started_at = COALESCE(started_at, ?3)
         WHERE id = ?4 AND status IN ('pending', 'running')",
        params![status, error_message, completed_at, id],
    )?;
    Ok(())
}

pub fn get_import_run(conn: &Connection, id: i64) -> Result<Option<ImportRun>> {
    let result = conn.query_row(
        &format!("SELECT {} FROM import_logs WHERE id = ?1", IMPORT_RUN_COLUMNS),
        params![id],
        map_import_run,
    ).optional()?;
    Ok(result)
}

pub fn list_import_runs(conn: &Connection, source: Option<&str>, limit: i64) -> Result<Vec<ImportRun>> {
    let mut stmt = match source {
        Some(_) => conn.prepare(&format!(
            "SELECT {} FROM import_logs WHERE source = ?1 ORDER BY id DESC LIMIT ?2",
            IMPORT_RUN_COLUMNS
        ))?,
        None => conn.prepare(&format!(
            "SELECT {} FROM import_logs ORDER BY id DESC LIMIT ?1",
            IMPORT_RUN_COLUMNS
        ))?,
    };

    let runs = match source {
        Some(src) => stmt.query_map(params![src, limit], map_import_run)?,
        None => stmt.query_map(params![limit], map_import_run)?,
    }.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(runs)
}

// ----- Import rows -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRow {
    pub id: i64,
    pub import_id: i64,
    pub source_row: i64,
    pub status: String,
    pub doctor_id: Option<i64>,
    pub error_message: Option<String>,
    pub raw_data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewImportRow<'a> {
    pub import_id: i64,
    pub source_row: i64,
    pub status: &'a str,
    pub doctor_id: Option<i64>,
    pub error_message: Option<&'a str>,
    pub raw_data: &'a str,
}

/// Append a row result. Row results are never updated or deleted.
pub fn insert_import_row(conn: &Connection, row: &NewImportRow) -> Result<i64> {
    conn.execute(
        "INSERT INTO import_rows (import_id, source_row, status, doctor_id, error_message, raw_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.import_id,
            row.source_row,
            row.status,
            row.doctor_id,
            row.error_message,
            row.raw_data,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_import_rows(conn: &Connection, import_id: i64, status: Option<&str>) -> Result<Vec<ImportRow>> {
    let mut stmt = match status {
        Some(_) => conn.prepare(
            "SELECT id, import_id, source_row, status, doctor_id, error_message, raw_data
             FROM import_rows WHERE import_id = ?1 AND status = ?2 ORDER BY source_row ASC, id ASC"
        )?,
        None => conn.prepare(
            "SELECT id, import_id, source_row, status, doctor_id, error_message, raw_data
             FROM import_rows WHERE import_id = ?1 ORDER BY source_row ASC, id ASC"
        )?,
    };

    let map = |row: &rusqlite::Row| {
        Ok(ImportRow {
            id: row.get(0)?,
            import_id: row.get(1)?,
            source_row: row.get(2)?,
            status: row.get(3)?,
            doctor_id: row.get(4)?,
            error_message: row.get(5)?,
            raw_data: row.get(6)?,
        })
    };

    let rows = match status {
        Some(st) => stmt.query_map(params![import_id, st], map)?,
        None => stmt.query_map(params![import_id], map)?,
    }.collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ----- Normalization mappings -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: i64,
    pub mapping_type: String,
    pub source_value: String,
    pub normalized_value: String,
    pub confidence: Option<f64>,
    pub is_manual_override: bool,
}

fn check_mapping_type(mapping_type: &str) -> Result<()> {
    if MAPPING_TYPES.contains(&mapping_type) {
        Ok(())
    } else {
        Err(DocrateError::Other(format!(
            "Unknown mapping type '{}' (expected one of: {})",
            mapping_type,
            MAPPING_TYPES.join(", ")
        )))
    }
}

/// Normalized value for a source value, if one is known.
pub fn lookup_mapping(conn: &Connection, mapping_type: &str, source_value: &str) -> Result<Option<String>> {
    let result = conn.query_row(
        "SELECT normalized_value FROM ai_mappings WHERE mapping_type = ?1 AND source_value = ?2",
        params![mapping_type, source_value],
        |row| row.get(0),
    ).optional()?;
    Ok(result)
}

/// Insert or replace a mapping. Automatic suggestions never overwrite a
/// manual override.
pub fn upsert_mapping(
    conn: &Connection,
    mapping_type: &str,
    source_value: &str,
    normalized_value: &str,
    confidence: Option<f64>,
    manual: bool,
) -> Result<()> {
    check_mapping_type(mapping_type)?;

    conn.execute(
        "INSERT INTO ai_mappings (mapping_type, source_value, normalized_value, confidence, is_manual_override)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(mapping_type, source_value) DO UPDATE SET
            normalized_value = excluded.normalized_value,
            confidence = excluded.confidence,
            is_manual_override = excluded.is_manual_override,
            updated_at = datetime('now')
         WHERE excluded.is_manual_override = 1 OR ai_mappings.is_manual_override = 0",
        params![mapping_type, source_value, normalized_value, confidence, manual],
    )?;
    Ok(())
}

pub fn get_mapping(conn: &Connection, mapping_type: &str, source_value: &str) -> Result<Option<Mapping>> {
    let result = conn.query_row(
        "SELECT id, mapping_type, source_value, normalized_value, confidence, is_manual_override
         FROM ai_mappings WHERE mapping_type = ?1 AND source_value = ?2",
        params![mapping_type, source_value],
        |row| {
            Ok(Mapping {
                id: row.get(0)?,
                mapping_type: row.get(1)?,
                source_value: row.get(2)?,
                normalized_value: row.get(3)?,
                confidence: row.get(4)?,
                is_manual_override: row.get(5)?,
            })
        },
    ).optional()?;
    Ok(result)
}
