//! End-to-end `PipelineFunction`: a fake solver script writes a value file
//! and one gradient file per variable, and the function reads them back
//! through `TableReader`/`PreStringHandler`.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;
use std::sync::Arc;

use extopt_core::function::{Function, PipelineFunction};
use extopt_core::parser::{PreStringHandler, TableReader};
use extopt_core::run::ExternalRun;
use extopt_core::writer::LabelReplacer;
use extopt_core::Variable;

fn write_script(path: &std::path::Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

#[test]
fn value_and_gradient_round_trip_through_files() {
    let dir = tempfile::tempdir().unwrap();

    let template = dir.path().join("input.template");
    fs::write(&template, "X __X__\n").unwrap();

    let script = dir.path().join("solve.sh");
    write_script(
        &script,
        "#!/bin/sh\n\
         x=$(awk '{print $2}' input.template)\n\
         awk -v x=\"$x\" 'BEGIN { printf \"OBJ %f\\n\", x*x }' > objective.txt\n\
         awk -v x=\"$x\" 'BEGIN { printf \"GRAD %f\\n\", 2*x }' > gradient.txt\n",
    );

    let writer: Arc<dyn extopt_core::writer::Writer + Send + Sync> = Arc::new(LabelReplacer::new("__X__"));
    let x = Rc::new(std::cell::RefCell::new(
        Variable::new("x", vec![3.0], vec![-10.0], vec![10.0], writer).unwrap(),
    ));

    let work_dir = dir.path().join("eval");
    let mut run = ExternalRun::new(&work_dir, script.display().to_string());
    run.add_config(template.clone()).unwrap();
    run.update_variables(std::slice::from_ref(&x));
    run.add_expected("objective.txt");
    run.add_expected("gradient.txt");
    let run = run.into_handle();

    let mut function = PipelineFunction::new(
        "quadratic",
        work_dir.join("objective.txt"),
        Box::new(PreStringHandler::new("OBJ", " ")),
    );
    function.add_value_step(run.clone());
    function.add_gradient_step(run.clone());
    function.add_input_variable(x.clone(), work_dir.join("gradient.txt"), Box::new(PreStringHandler::new("GRAD", " ")));

    let value = function.get_value().unwrap();
    assert!((value - 9.0).abs() < 1e-6, "expected 3^2 = 9, got {value}");

    let gradient = function.get_gradient(None).unwrap();
    assert_eq!(gradient.len(), 1);
    assert!((gradient[0] - 6.0).abs() < 1e-6, "expected 2*3 = 6, got {gradient:?}");
}

#[test]
fn table_reader_extracts_single_cell() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.txt");
    fs::write(&path, "header\n1.0 2.0 3.0\n4.0 5.0 6.0\n").unwrap();

    let mut reader = TableReader::new(Some(1), Some(2));
    reader.start = (1, 0);
    let value = extopt_core::parser::Parser::read(&reader, &path).unwrap();
    assert_eq!(value.sum(), 6.0);

    reader.row = None;
    reader.col = Some(0);
    let column = extopt_core::parser::Parser::read(&reader, &path).unwrap();
    assert_eq!(column.as_slice(), vec![1.0, 4.0]);
}
