use super::*;
use crate::clock::ManualClock;
use crate::constants::IMPORT_LOCK_KEY;
use crate::parser::{FormatReader, GridRow, SourceKind};
use chrono::DateTime;
use std::cell::Cell;
use crate::db::migrations::MigrationRunner;
use crate::settings::SqliteSettings;
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use tempfile::TempDir;

const HEADER: &str = "first name,last name,license,phone,city,specialty\n";

fn setup() -> Connection {
    let conn = crate::db::open_in_memory().unwrap();
    let settings = SqliteSettings::open(&conn).unwrap();
    MigrationRunner::new(&conn, &settings).migrate().unwrap();
    conn
}

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 10, 8, 30, 0).unwrap())
}

fn write_csv(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("{}{}", HEADER, body)).unwrap();
    path
}

const FIVE_ROWS: &str = "\
Dana,Levi,1001,050-1234567,Haifa,Cardiology
Avi,Cohen,1002,,Tel Aviv,
,,1003,,Eilat,
Sara,Mizrahi,1004,,Jerusalem,
Yossi,Peretz,1005,,Haifa,
";

#[test]
fn test_import_with_one_bad_row() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "clalit.csv", FIVE_ROWS);

    let importer = Importer::new(&conn, &settings, &clock);
    let summary = importer.run(&ImportRequest::new(&path, "clalit")).unwrap();

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.file, "clalit.csv");
    assert_eq!(summary.counters.total_rows, 5);
    assert_eq!(summary.counters.processed_rows, 5);
    assert_eq!(summary.counters.error_count, 1);
    assert_eq!(summary.success_count(), 4);
    assert_eq!(summary.counters.new_count, 4);
    assert!(summary.ensure_completed().is_ok());

    // Lock released
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);

    let run = schema::get_import_run(&conn, summary.run_id).unwrap().unwrap();
    assert_eq!(run.status, "completed");
    assert_eq!(run.processed_rows, 5);
    assert_eq!(run.success_count() + run.error_count + run.skipped_count, run.processed_rows);
    assert_eq!(run.started_at.as_deref(), Some("2026-05-10T08:30:00Z"));

    let errors = schema::list_import_rows(&conn, summary.run_id, Some("error")).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source_row, 4);
    assert!(errors[0].error_message.as_deref().unwrap().contains("first_name, last_name"));
    let raw: serde_json::Value = serde_json::from_str(errors[0].raw_data.as_deref().unwrap()).unwrap();
    assert_eq!(raw["license"], "1003");

    assert_eq!(schema::list_import_rows(&conn, summary.run_id, None).unwrap().len(), 5);
    assert_eq!(schema::count_doctors(&conn).unwrap(), 4);
}

#[test]
fn test_rows_are_sanitized_and_linked() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "clalit.csv", "<b>Dana</b>,Levi2,  MD-1001 ,Tel: 050-1234567,Haifa,Cardiology<script>x</script>\n");

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap();
    assert_eq!(summary.counters.new_count, 1);

    let doctor = schema::find_doctor_by_license(&conn, "MD-1001").unwrap().unwrap();
    assert_eq!(doctor.first_name, "Dana");
    assert_eq!(doctor.last_name, "Levi");
    assert_eq!(doctor.phone.as_deref(), Some("050-1234567"));

    let specialties = schema::list_doctor_specialties(&conn, doctor.id).unwrap();
    assert_eq!(specialties.len(), 1);
    assert_eq!(specialties[0].source_specialty, "Cardiology");
    assert_eq!(specialties[0].source_company, "clalit");

    let arrangements = schema::list_doctor_arrangements(&conn, doctor.id).unwrap();
    assert_eq!(arrangements.len(), 1);
    assert_eq!(arrangements[0].insurance_company, "clalit");
    assert_eq!(arrangements[0].import_id, Some(summary.run_id));
    assert_eq!(arrangements[0].updated_at, "2026-05-10T08:30:00Z");
}

#[test]
fn test_lock_held_records_failed_run() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "maccabi.csv", FIVE_ROWS);

    let other = ImportLock::new(&settings, &clock);
    other.acquire("clalit").unwrap();
    clock.advance(60);

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "maccabi"))
        .unwrap();

    assert_eq!(summary.status, "failed");
    assert_eq!(summary.error_code.as_deref(), Some("import_locked"));
    assert_eq!(summary.counters.processed_rows, 0);
    let run = schema::get_import_run(&conn, summary.run_id).unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(
        run.error_message.as_deref(),
        Some("Import already running since 2026-05-10 08:30:00 (source: clalit), started 1 minute ago. Please wait.")
    );

    let err = summary.ensure_completed().unwrap_err();
    assert_eq!(err.code(), "run_aborted");

    // The other holder's lock is untouched
    assert_eq!(other.is_locked().unwrap().unwrap().source, "clalit");
    assert_eq!(schema::count_doctors(&conn).unwrap(), 0);
}

#[test]
fn test_stale_lock_does_not_block() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "maccabi.csv", FIVE_ROWS);

    ImportLock::new(&settings, &clock).acquire("crashed").unwrap();
    clock.advance(120);

    let summary = Importer::new(&conn, &settings, &clock)
        .with_lock_ttl(60)
        .run(&ImportRequest::new(&path, "maccabi"))
        .unwrap();
    assert_eq!(summary.status, "completed");
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);
}

#[test]
fn test_parse_failure_fails_run_and_releases_lock() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();

    let importer = Importer::new(&conn, &settings, &clock);
    let summary = importer
        .run(&ImportRequest::new(tmp.path().join("missing.csv"), "clalit"))
        .unwrap();

    assert_eq!(summary.status, "failed");
    assert_eq!(summary.error_code.as_deref(), Some("file_not_found"));
    let run = schema::get_import_run(&conn, summary.run_id).unwrap().unwrap();
    assert!(run.error_message.unwrap().starts_with("File not found"));
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);

    let pdf = tmp.path().join("doctors.pdf");
    std::fs::write(&pdf, "%PDF").unwrap();
    let summary = importer.run(&ImportRequest::new(&pdf, "clalit")).unwrap();
    assert_eq!(summary.error_code.as_deref(), Some("unsupported_format"));
}

#[test]
fn test_reimport_updates_existing_doctors() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let importer = Importer::new(&conn, &settings, &clock);

    let first = write_csv(&tmp, "v1.csv", "Dana,Levi,1001,050-1234567,Haifa,\n");
    importer.run(&ImportRequest::new(&first, "clalit")).unwrap();

    // Empty phone must not wipe the stored one
    let second = write_csv(&tmp, "v2.csv", "Dana,Levi,1001,,Nesher,\n");
    let summary = importer.run(&ImportRequest::new(&second, "clalit")).unwrap();

    assert_eq!(summary.counters.new_count, 0);
    assert_eq!(summary.counters.updated_count, 1);
    assert_eq!(schema::count_doctors(&conn).unwrap(), 1);

    let doctor = schema::find_doctor_by_license(&conn, "1001").unwrap().unwrap();
    assert_eq!(doctor.phone.as_deref(), Some("050-1234567"));
    assert_eq!(doctor.city.as_deref(), Some("Nesher"));

    let arrangements = schema::list_doctor_arrangements(&conn, doctor.id).unwrap();
    assert_eq!(arrangements.len(), 1);
    assert_eq!(arrangements[0].source_file.as_deref(), Some("v2.csv"));
}

#[test]
fn test_name_and_city_identify_unlicensed_doctors() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let importer = Importer::new(&conn, &settings, &clock);

    let path = write_csv(&tmp, "a.csv", "Avi,Cohen,,,Haifa,\nAvi,Cohen,,,Eilat,\n");
    let summary = importer.run(&ImportRequest::new(&path, "harel")).unwrap();
    assert_eq!(summary.counters.new_count, 2);

    let again = write_csv(&tmp, "b.csv", "Avi,Cohen,,052-7654321,Haifa,\n");
    let summary = importer.run(&ImportRequest::new(&again, "harel")).unwrap();
    assert_eq!(summary.counters.updated_count, 1);
    assert_eq!(schema::count_doctors(&conn).unwrap(), 2);

    let haifa = schema::find_doctor_by_name_city(&conn, "Avi", "Cohen", "Haifa").unwrap().unwrap();
    assert_eq!(haifa.phone.as_deref(), Some("052-7654321"));
}

#[test]
fn test_duplicate_rows_in_one_file_are_skipped() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "dup.csv", "Dana,Levi,1001,,Haifa,\nDana,Levi,1001,,Haifa,\nAvi,Cohen,1002,,Haifa,\n");

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap();

    assert_eq!(summary.counters.processed_rows, 3);
    assert_eq!(summary.counters.new_count, 2);
    assert_eq!(summary.counters.skipped_count, 1);

    let skipped = schema::list_import_rows(&conn, summary.run_id, Some("skipped")).unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].source_row, 3);
    assert_eq!(skipped[0].error_message.as_deref(), Some("Duplicate of source row 2"));
    assert!(skipped[0].doctor_id.is_some());
}

#[test]
fn test_specialty_is_normalized_through_mappings() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    schema::upsert_mapping(&conn, "specialty", "קרדיולוגיה", "Cardiology", None, true).unwrap();

    let path = tmp.path().join("heb.csv");
    std::fs::write(&path, "שם פרטי,שם משפחה,מספר רישיון,התמחות\nדנה,לוי,2001,קרדיולוגיה\n").unwrap();

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "meuhedet"))
        .unwrap();
    assert_eq!(summary.counters.new_count, 1);
    assert_eq!(summary.mapping.get(CanonicalField::FirstName), Some("שם פרטי"));

    let doctor = schema::find_doctor_by_license(&conn, "2001").unwrap().unwrap();
    assert_eq!(doctor.first_name, "דנה");
    let specialties = schema::list_doctor_specialties(&conn, doctor.id).unwrap();
    assert_eq!(specialties[0].normalized_specialty.as_deref(), Some("Cardiology"));
}

#[test]
fn test_explicit_mapping_overrides_detection() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("odd.csv");
    std::fs::write(&path, "given,family,id\nDana,Levi,3001\n").unwrap();

    let mut mapping = ColumnMapping::new();
    mapping.insert(CanonicalField::FirstName, "given");
    mapping.insert(CanonicalField::LastName, "family");
    mapping.insert(CanonicalField::LicenseNumber, "id");

    let mut request = ImportRequest::new(&path, "clalit");
    request.mapping = Some(mapping);
    let summary = Importer::new(&conn, &settings, &clock).run(&request).unwrap();

    assert_eq!(summary.counters.new_count, 1);
    assert!(schema::find_doctor_by_license(&conn, "3001").unwrap().is_some());
}

#[test]
fn test_failing_row_is_rolled_back_and_run_continues() {
    let conn = setup();
    conn.execute_batch(
        "CREATE TRIGGER reject_boom BEFORE INSERT ON arrangements
         WHEN (SELECT last_name FROM doctors WHERE id = NEW.doctor_id) = 'Boom'
         BEGIN SELECT RAISE(ABORT, 'arrangement rejected'); END;",
    )
    .unwrap();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "t.csv", "Dana,Boom,1001,,Haifa,\nAvi,Cohen,1002,,Haifa,\n");

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap();

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.counters.error_count, 1);
    assert_eq!(summary.counters.new_count, 1);
    // The doctor insert from the failed row was rolled back with it
    assert!(schema::find_doctor_by_license(&conn, "1001").unwrap().is_none());

    let errors = schema::list_import_rows(&conn, summary.run_id, Some("error")).unwrap();
    assert_eq!(errors[0].source_row, 2);
    assert!(errors[0].error_message.as_deref().unwrap().contains("arrangement rejected"));
}

#[test]
fn test_batch_reports_each_file() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let good = write_csv(&tmp, "good.csv", "Dana,Levi,1001,,Haifa,\n");
    let missing = tmp.path().join("gone.csv");

    let importer = Importer::new(&conn, &settings, &clock);
    let items = importer.run_batch(&[missing, good], &ImportRequest::new("", "clalit"));

    assert_eq!(items.len(), 2);
    let first = items[0].outcome.as_ref().unwrap();
    assert_eq!(first.status, "failed");
    assert_eq!(first.error_code.as_deref(), Some("file_not_found"));
    let second = items[1].outcome.as_ref().unwrap();
    assert_eq!(second.status, "completed");
    assert_eq!(second.counters.new_count, 1);
    assert_eq!(schema::list_import_runs(&conn, None, 10).unwrap().len(), 2);
}

#[test]
fn test_storage_failure_midway_marks_run_failed() {
    let conn = setup();
    conn.execute_batch(
        "CREATE TRIGGER reject_error_rows BEFORE INSERT ON import_rows
         WHEN NEW.status = 'error'
         BEGIN SELECT RAISE(ABORT, 'error rows rejected'); END;",
    )
    .unwrap();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "clalit.csv", FIVE_ROWS);

    let err = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap_err();
    assert_eq!(err.code(), "database_error");

    let runs = schema::list_import_runs(&conn, None, 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
    assert_eq!(runs[0].processed_rows, 2);
    assert!(runs[0].error_message.as_deref().unwrap().contains("error rows rejected"));
    assert!(runs[0].completed_at.is_some());
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);
}

struct ExplodingReader;

impl FormatReader for ExplodingReader {
    fn kind(&self) -> SourceKind {
        SourceKind::DelimitedText
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["csv"]
    }

    fn read_grid(&self, _path: &Path, _options: &ParseOptions) -> Result<Vec<GridRow>> {
        panic!("decoder exploded")
    }
}

#[test]
fn test_panicking_reader_fails_run_and_releases_lock() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    let clock = clock();
    let tmp = TempDir::new().unwrap();
    let path = write_csv(&tmp, "clalit.csv", FIVE_ROWS);

    let mut registry = FormatRegistry::default();
    registry.register(Box::new(ExplodingReader));

    let err = Importer::new(&conn, &settings, &clock)
        .with_registry(registry)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap_err();
    assert_eq!(err.code(), "run_aborted");
    assert!(err.to_string().contains("decoder exploded"));

    let runs = schema::list_import_runs(&conn, None, 10).unwrap();
    assert_eq!(runs[0].status, "failed");
    assert!(runs[0].error_message.as_deref().unwrap().contains("decoder exploded"));
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);

    // The next import is not blocked
    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap();
    assert!(summary.is_completed());
}

/// Clock that panics on one specific read.
struct FaultyClock {
    inner: ManualClock,
    calls: Cell<usize>,
    panic_on: usize,
}

impl Clock for FaultyClock {
    fn now(&self) -> DateTime<Utc> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if call == self.panic_on {
            panic!("clock fault");
        }
        self.inner.now()
    }
}

#[test]
fn test_panicking_row_is_rolled_back_and_run_continues() {
    let conn = setup();
    let settings = SqliteSettings::open(&conn).unwrap();
    // Reads: lock acquire, run start, then one per persisted row. The 4th
    // lands inside the second row's transaction.
    let clock = FaultyClock {
        inner: clock(),
        calls: Cell::new(0),
        panic_on: 4,
    };
    let tmp = TempDir::new().unwrap();
    let path = write_csv(
        &tmp,
        "clalit.csv",
        "Dana,Levi,1001,,Haifa,\nAvi,Cohen,1002,,Haifa,\nSara,Mizrahi,1003,,Haifa,\n",
    );

    let summary = Importer::new(&conn, &settings, &clock)
        .run(&ImportRequest::new(&path, "clalit"))
        .unwrap();

    assert_eq!(summary.status, "completed");
    assert_eq!(summary.counters.processed_rows, 3);
    assert_eq!(summary.counters.new_count, 2);
    assert_eq!(summary.counters.error_count, 1);
    assert!(schema::find_doctor_by_license(&conn, "1002").unwrap().is_none());

    let errors = schema::list_import_rows(&conn, summary.run_id, Some("error")).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source_row, 3);
    assert!(errors[0]
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Row processing panicked: clock fault"));
    assert_eq!(settings.get(IMPORT_LOCK_KEY).unwrap(), None);
}
