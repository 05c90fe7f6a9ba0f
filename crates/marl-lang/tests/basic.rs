use std::fs;

use marl_core::error::MarlError;
use marl_lang::{run, RunRequest};

fn eval_source(src: &str) -> Result<String, MarlError> {
    run(&RunRequest::for_source(src))
}

#[test]
fn scalars_render_in_source_syntax() {
    assert_eq!(eval_source("42").unwrap(), "42");
    assert_eq!(eval_source("\"a\\nb\"").unwrap(), "\"a\\nb\"");
    assert_eq!(eval_source("true").unwrap(), "true");
    assert_eq!(eval_source("null").unwrap(), "null");
    assert_eq!(eval_source("/etc/hosts").unwrap(), "/etc/hosts");
}

#[test]
fn attribute_sets_render_in_key_order() {
    let out = eval_source("{ b = 2; a = 1; }").unwrap();
    assert_eq!(out, "{ a = 1; b = 2; }");
}

#[test]
fn nested_structures_render_strictly() {
    let out = eval_source("{ xs = [ 1 (1 + 1) ]; f = x: x; }").unwrap();
    assert_eq!(out, "{ f = <lambda>; xs = [ 1 2 ]; }");
}

#[test]
fn non_strict_mode_leaves_suspensions_opaque() {
    let mut request = RunRequest::for_source("{ a = 1 + 1; }");
    request.strict = false;
    assert_eq!(run(&request).unwrap(), "{ a = <code>; }");
}

#[test]
fn let_with_and_rec_work_together() {
    let out = eval_source(
        "let pkgs = rec { version = \"1.2\"; name = \"tool-\" + version; }; in \
         with pkgs; name",
    )
    .unwrap();
    assert_eq!(out, "\"tool-1.2\"");
}

#[test]
fn update_and_concat_operators() {
    assert_eq!(
        eval_source("{ a = 1; } // { b = 2; }").unwrap(),
        "{ a = 1; b = 2; }"
    );
    assert_eq!(eval_source("[ 1 ] ++ [ 2 3 ]").unwrap(), "[ 1 2 3 ]");
}

#[test]
fn function_patterns_and_defaults() {
    assert_eq!(
        eval_source("({ x, y ? x + 1 }: y) { x = 10; }").unwrap(),
        "11"
    );
    assert_eq!(
        eval_source("({ name, ... } @ args: args.extra + name) { name = \"a\"; extra = \"b\"; }")
            .unwrap(),
        "\"ba\""
    );
}

#[test]
fn errors_surface_with_messages() {
    let err = eval_source("nope").unwrap_err();
    assert!(err.to_string().contains("undefined variable `nope`"));

    let err = eval_source("assert false; 1").unwrap_err();
    assert!(err.to_string().contains("assertion failed"));

    let err = eval_source("let x = 1; in x.y").unwrap_err();
    assert!(err.to_string().contains("attribute set was expected"));
}

#[test]
fn files_evaluate_with_relative_imports() {
    let dir = std::env::temp_dir().join(format!("marl-cli-test-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("inner.marl"), "2 + 3").unwrap();
    fs::write(dir.join("outer.marl"), "(import ./inner.marl) + 1").unwrap();

    let request = RunRequest {
        source: None,
        file: Some(dir.join("outer.marl")),
        strict: true,
        options: Default::default(),
    };
    assert_eq!(run(&request).unwrap(), "6");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_file_reports_an_error() {
    let request = RunRequest {
        source: None,
        file: Some("/does/not/exist.marl".into()),
        strict: true,
        options: Default::default(),
    };
    let err = run(&request).unwrap_err();
    assert!(err.to_string().contains("cannot read"));
}
