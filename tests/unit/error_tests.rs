use agent_warden::AppError;

#[test]
fn display_prefixes_the_error_kind() {
    assert_eq!(
        AppError::Precondition("agent planner not found".into()).to_string(),
        "precondition: agent planner not found"
    );
    assert_eq!(
        AppError::LockContention("ledger busy".into()).to_string(),
        "lock contention: ledger busy"
    );
    assert_eq!(
        AppError::Corruption("cycle".into()).to_string(),
        "corruption: cycle"
    );
}

#[test]
fn data_loss_names_table_and_counts() {
    let err = AppError::DataLoss {
        migration: "0004_prune".into(),
        table: "spawn".into(),
        before: 12,
        after: 3,
    };
    let text = err.to_string();
    assert!(text.contains("0004_prune"));
    assert!(text.contains("spawn"));
    assert!(text.contains("12"));
    assert!(text.contains('3'));
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("gone")));
}

#[test]
fn sqlx_errors_convert_to_db() {
    let err: AppError = sqlx::Error::RowNotFound.into();
    assert!(matches!(err, AppError::Db(_)));
}
