use finbench_driver::{
    read_validation_cases, stream_from_vec, ConnectorError, DbConnector, DbSession, DbValidator,
    Driver, DriverConfig, DriverLog, DriverMode, DummyConfig, DummyConnector, Operation,
    OperationOutcome, OperationType, TypeQuotaFilter, ValidationCase, ValidationError,
    ValidationParamsCreator,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn case(op_type: &str, id: u64, correct: bool) -> ValidationCase {
    let payload = json!({ "account": id });
    let expected = if correct {
        json!({ "operation_type": op_type, "payload": payload })
    } else {
        json!({ "operation_type": op_type, "payload": { "account": id + 1 } })
    };
    ValidationCase {
        operation: Operation::new(op_type, id, payload),
        expected,
    }
}

fn write_cases(path: &Path, cases: &[ValidationCase]) {
    let body: Vec<String> = cases
        .iter()
        .map(|case| serde_json::to_string(case).unwrap())
        .collect();
    fs::write(path, body.join("\n") + "\n").unwrap();
}

#[test]
fn correct_incorrect_and_crashed_results_are_tallied() {
    let connector = DummyConnector::new(DummyConfig {
        failing_types: ["withdraw".to_string()].into_iter().collect(),
        unsupported_types: ["audit".to_string()].into_iter().collect(),
        ..DummyConfig::default()
    });
    let cases = vec![
        case("deposit", 1, true),
        case("deposit", 2, false),
        case("withdraw", 3, true),
        case("audit", 4, true),
        case("read", 5, true),
    ];
    let report = DbValidator::new()
        .validate(&connector, cases, &DriverLog::capture("db-test"))
        .unwrap();

    assert_eq!(report.connector, "dummy");
    assert_eq!(report.processed, 4);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.incorrect, 1);
    assert_eq!(report.crashed, 1);
    assert!(report
        .missing_handlers
        .contains(&OperationType::new("audit")));
    assert_eq!(
        report.successful_per_type[&OperationType::new("deposit")],
        1
    );
    assert_eq!(report.incorrect_results[0].actual["payload"]["account"], 2);
    assert!(!report.passed());
}

#[test]
fn disabled_types_are_skipped() {
    let connector = DummyConnector::new(DummyConfig::default());
    let report = DbValidator::new()
        .with_enabled_types([OperationType::new("read")])
        .validate(
            &connector,
            vec![case("read", 1, true), case("deposit", 2, false)],
            &DriverLog::capture("db-test"),
        )
        .unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.processed, 1);
    assert!(report.passed());
}

#[test]
fn malformed_case_files_report_the_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cases.json");
    let good = serde_json::to_string(&case("read", 1, true)).unwrap();
    fs::write(&path, format!("{good}\n\n{{ \"operation\": 3 }}\n")).unwrap();
    match read_validation_cases(&path) {
        Err(ValidationError::MalformedCase { line, .. }) => assert_eq!(line, 3),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn driver_writes_failed_results_next_to_the_run() {
    let dir = tempdir().unwrap();
    let cases_path = dir.path().join("validation_params.json");
    write_cases(
        &cases_path,
        &[case("deposit", 1, true), case("deposit", 2, false)],
    );
    let results = dir.path().join("results");
    let config = DriverConfig {
        mode: DriverMode::ValidateDatabase,
        database_validation_file: Some(cases_path),
        results_dir: Some(results.clone()),
        ..DriverConfig::default()
    };
    config.validate().unwrap();

    let report = Driver::new(config, DriverLog::capture("db-test"))
        .validate_database()
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.incorrect, 1);

    let actual: Value = serde_json::from_str(
        &fs::read_to_string(results.join("validation_params-failed-actual.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(actual[0]["result"]["payload"]["account"], 2);
    let expected: Value = serde_json::from_str(
        &fs::read_to_string(results.join("validation_params-failed-expected.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(expected[0]["result"]["payload"]["account"], 3);
}

fn synthetic_config(cases_path: PathBuf, validation_types: Value) -> DriverConfig {
    let mut config = DriverConfig {
        mode: DriverMode::CreateValidation,
        database_validation_file: Some(cases_path),
        validation_parameters_size: 10,
        ..DriverConfig::default()
    };
    config.workload.properties = json!({
        "operation_types": ["deposit", "withdraw", "read"],
        "operations_per_stream": 20,
        "validation_types": validation_types,
    });
    config
}

#[test]
fn created_parameters_validate_against_the_same_connector() {
    let dir = tempdir().unwrap();
    let cases_path = dir.path().join("validation_params.json");
    let config = synthetic_config(cases_path.clone(), json!(["deposit", "withdraw"]));
    config.validate().unwrap();

    let created = Driver::new(config.clone(), DriverLog::capture("db-test"))
        .create_validation()
        .unwrap();
    assert_eq!(created.written, 10);
    assert_eq!(created.written_per_type[&OperationType::new("deposit")], 5);
    assert_eq!(created.written_per_type[&OperationType::new("withdraw")], 5);
    assert!(!created
        .written_per_type
        .contains_key(&OperationType::new("read")));
    assert_eq!(
        created.considered,
        created.written + created.filtered + created.failed
    );

    let cases = read_validation_cases(&cases_path).unwrap();
    assert_eq!(cases.len(), 10);
    assert_eq!(cases[0].expected["operation_type"], "deposit");
    assert_eq!(cases[0].expected["payload"], *cases[0].operation.payload());

    let mut replay = config;
    replay.mode = DriverMode::ValidateDatabase;
    replay.validate().unwrap();
    let report = Driver::new(replay, DriverLog::capture("db-test"))
        .validate_database()
        .unwrap();
    assert_eq!(report.processed, 10);
    assert_eq!(report.succeeded, 10);
    assert_eq!(report.skipped, 0);
    assert!(report.passed());
}

#[test]
fn create_validation_requires_a_target_file() {
    let mut config = synthetic_config(PathBuf::from("unused.json"), Value::Null);
    config.database_validation_file = None;
    assert!(config.validate().is_err());
    assert!(Driver::new(config, DriverLog::capture("db-test"))
        .create_validation()
        .is_err());
}

#[test]
fn failed_operations_are_left_out_of_created_parameters() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cases.json");
    let connector = DummyConnector::new(DummyConfig {
        failing_types: ["withdraw".to_string()].into_iter().collect(),
        ..DummyConfig::default()
    });
    let operations = vec![
        Operation::new("deposit", 1, json!({ "id": 1 })),
        Operation::new("withdraw", 2, json!({ "id": 2 })),
        Operation::new("deposit", 3, json!({ "id": 3 })),
        Operation::new("read", 4, json!({ "id": 4 })),
        Operation::new("read", 5, json!({ "id": 5 })),
    ];
    let mut filter = TypeQuotaFilter::new(None, 3);
    let report = ValidationParamsCreator::new(3)
        .with_serialization_check(true)
        .create(
            &connector,
            stream_from_vec(operations),
            &mut filter,
            &path,
            &DriverLog::capture("db-test"),
        )
        .unwrap();
    assert_eq!(report.written, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.considered, 4);

    let cases = read_validation_cases(&path).unwrap();
    let times: Vec<u64> = cases.iter().map(|case| case.operation.original_ms()).collect();
    assert_eq!(times, vec![1, 3, 4]);
}

#[test]
fn driver_skips_types_the_workload_does_not_validate() {
    let dir = tempdir().unwrap();
    let cases_path = dir.path().join("cases.json");
    write_cases(
        &cases_path,
        &[
            case("deposit", 1, true),
            case("read", 2, false),
            case("read", 3, true),
        ],
    );
    let mut config = synthetic_config(cases_path, json!(["deposit"]));
    config.mode = DriverMode::ValidateDatabase;
    config.validate().unwrap();

    let report = Driver::new(config, DriverLog::capture("db-test"))
        .validate_database()
        .unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.processed, 1);
    assert!(report.passed());
}

struct DroppedConnection {
    cleaned_up: Arc<AtomicBool>,
}

struct DroppedSession {
    cleaned_up: Arc<AtomicBool>,
}

impl DbConnector for DroppedConnection {
    fn name(&self) -> &str {
        "dropped"
    }

    fn init(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn open_session(&self, _worker: usize) -> Result<Box<dyn DbSession>, ConnectorError> {
        Ok(Box::new(DroppedSession {
            cleaned_up: self.cleaned_up.clone(),
        }))
    }

    fn reset(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

impl DbSession for DroppedSession {
    fn execute(&mut self, _operation: &Operation) -> Result<OperationOutcome, ConnectorError> {
        Err(ConnectorError::Connection("socket closed".into()))
    }

    fn cleanup(&mut self) -> Result<(), ConnectorError> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn fatal_errors_still_clean_up_the_session() {
    let cleaned_up = Arc::new(AtomicBool::new(false));
    let connector = DroppedConnection {
        cleaned_up: cleaned_up.clone(),
    };
    let err = DbValidator::new()
        .validate(
            &connector,
            vec![case("deposit", 1, true)],
            &DriverLog::capture("db-test"),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::Connector(ConnectorError::Connection(_))
    ));
    assert!(cleaned_up.load(Ordering::SeqCst));
}
