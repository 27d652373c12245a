use vip_query::SamplingStrategy;
use vip_train::metrics::MetricRecord;
use vip_train::trainer::checkpoint_path;
use vip_train::{synthetic, TrainConfig, Trainer};

fn run_tiny(sampling: SamplingStrategy) -> (tempfile::TempDir, TrainConfig, vip_train::RunSummary) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TrainConfig::tiny();
    config.sampling = sampling;
    config.save_dir = dir.path().to_path_buf();
    config.run_name = format!("tiny-{}", sampling);

    let train = synthetic(&config.grid, 32, config.num_classes, 0).unwrap();
    let test = synthetic(&config.grid, 16, config.num_classes, 1).unwrap();
    let mut trainer = Trainer::new(config.clone()).unwrap();
    let summary = trainer.run(&train, &test).unwrap();
    (dir, config, summary)
}

#[test]
fn test_tiny_run_produces_finite_metrics() {
    let (_dir, config, summary) = run_tiny(SamplingStrategy::Random);
    assert_eq!(summary.epochs.len(), config.epochs);
    assert_eq!(summary.evals.len(), config.epochs);
    for epoch in &summary.epochs {
        assert!(epoch.loss_avg.is_finite());
        assert_eq!(epoch.steps, 4);
    }
    let last = summary.evals.last().unwrap();
    assert_eq!(last.samples, 16);
    assert!(last.qry_need_avg >= 1.0);
    assert!(last.qry_need_avg <= config.max_queries_test as f64);
    assert!(last.qry_need_std.is_finite());
}

#[test]
fn test_tau_and_lr_follow_schedules() {
    let (_dir, config, summary) = run_tiny(SamplingStrategy::RandomVariable);
    let first = &summary.epochs[0];
    let last = summary.epochs.last().unwrap();
    assert_eq!(first.tau, config.tau_start);
    assert!((last.tau - config.tau_end).abs() < 1e-6);
    assert_eq!(first.lr, config.lr);
    assert!(last.lr < first.lr);
}

#[test]
fn test_run_directory_layout() {
    let (_dir, config, _) = run_tiny(SamplingStrategy::Adaptive);
    let run_dir = config.run_dir();

    let params = std::fs::read_to_string(run_dir.join("params.json")).unwrap();
    assert_eq!(TrainConfig::from_json(&params).unwrap(), config);

    let metrics = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
    let records: Vec<MetricRecord> = metrics
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let evals = records.iter().filter(|r| matches!(r, MetricRecord::Eval(_))).count();
    let epochs = records.iter().filter(|r| matches!(r, MetricRecord::Epoch(_))).count();
    assert_eq!((epochs, evals), (config.epochs, config.epochs));

    for epoch in 0..config.epochs {
        assert!(checkpoint_path(&run_dir, epoch).exists());
    }
}
