use marl_core::error::MarlError;
use marl_lang::{run, RunRequest};

fn eval_source(src: &str) -> Result<String, MarlError> {
    run(&RunRequest::for_source(src))
}

#[test]
fn arithmetic_primops() {
    assert_eq!(eval_source("__add 1 2").unwrap(), "3");
    assert_eq!(eval_source("__sub 5 2").unwrap(), "3");
    assert_eq!(eval_source("__mul 3 4").unwrap(), "12");
    assert_eq!(eval_source("__div 10 2").unwrap(), "5");
    assert_eq!(eval_source("__lessThan 1 2").unwrap(), "true");
    assert_eq!(eval_source("builtins.lessThan 2 1").unwrap(), "false");
}

#[test]
fn division_by_zero_is_reported() {
    let err = eval_source("__div 1 0").unwrap_err();
    assert!(err.to_string().contains("division by zero"));
}

#[test]
fn list_primops() {
    assert_eq!(eval_source("__head [ 1 2 ]").unwrap(), "1");
    assert_eq!(eval_source("__tail [ 1 2 3 ]").unwrap(), "[ 2 3 ]");
    assert_eq!(eval_source("__length []").unwrap(), "0");
    assert_eq!(eval_source("__elemAt [ 10 20 ] 1").unwrap(), "20");
    assert_eq!(eval_source("__elem 2 [ 1 2 ]").unwrap(), "true");
    assert_eq!(eval_source("__elem 5 [ 1 2 ]").unwrap(), "false");
}

#[test]
fn map_is_lazy_per_element() {
    // The failing element only blows up when the whole list is forced.
    let ok = RunRequest {
        strict: false,
        ..RunRequest::for_source("map (x: x + 1) [ 1 (throw \"boom\") ]")
    };
    assert_eq!(run(&ok).unwrap(), "[ <code> <code> ]");

    let err = eval_source("map (x: x + 1) [ 1 (throw \"boom\") ]").unwrap_err();
    assert!(err.to_string().contains("boom"));

    assert_eq!(eval_source("map (x: x + 1) [ 1 2 3 ]").unwrap(), "[ 2 3 4 ]");
}

#[test]
fn attr_primops() {
    assert_eq!(
        eval_source("__attrNames { b = 1; a = 2; }").unwrap(),
        "[ \"a\" \"b\" ]"
    );
    assert_eq!(eval_source("__getAttr \"a\" { a = 7; }").unwrap(), "7");
    assert_eq!(eval_source("__hasAttr \"a\" { a = 7; }").unwrap(), "true");
    assert_eq!(
        eval_source("__removeAttrs { a = 1; b = 2; } [ \"a\" ]").unwrap(),
        "{ b = 2; }"
    );
}

#[test]
fn list_to_attrs_first_occurrence_wins() {
    let out = eval_source(
        "__listToAttrs [ { name = \"a\"; value = 1; } { name = \"a\"; value = 2; } ]",
    )
    .unwrap();
    assert_eq!(out, "{ a = 1; }");
}

#[test]
fn type_predicates() {
    assert_eq!(eval_source("isNull null").unwrap(), "true");
    assert_eq!(eval_source("__isFunction (x: x)").unwrap(), "true");
    assert_eq!(eval_source("__isFunction __add").unwrap(), "true");
    assert_eq!(eval_source("__isFunction (__add 1)").unwrap(), "true");
    assert_eq!(eval_source("__isString \"s\"").unwrap(), "true");
    assert_eq!(eval_source("__isInt 3").unwrap(), "true");
    assert_eq!(eval_source("__isBool false").unwrap(), "true");
    assert_eq!(eval_source("__isList []").unwrap(), "true");
    assert_eq!(eval_source("__isList {}").unwrap(), "false");
}

#[test]
fn type_of_names_tags() {
    assert_eq!(eval_source("__typeOf 1").unwrap(), "\"int\"");
    assert_eq!(eval_source("__typeOf {}").unwrap(), "\"set\"");
    assert_eq!(eval_source("__typeOf (x: x)").unwrap(), "\"lambda\"");
    assert_eq!(eval_source("__typeOf __add").unwrap(), "\"primop\"");
}

#[test]
fn string_primops() {
    assert_eq!(eval_source("__stringLength \"hello\"").unwrap(), "5");
    assert_eq!(eval_source("__substring 1 2 \"hello\"").unwrap(), "\"el\"");
    assert_eq!(eval_source("__substring 1 100 \"hi\"").unwrap(), "\"i\"");
    assert_eq!(eval_source("baseNameOf \"/a/b/c.txt\"").unwrap(), "\"c.txt\"");
    assert_eq!(eval_source("dirOf \"/a/b/c.txt\"").unwrap(), "\"/a/b\"");
    assert_eq!(eval_source("dirOf \"plain\"").unwrap(), "\".\"");
}

#[test]
fn throw_and_abort_carry_their_message() {
    let err = eval_source("throw \"bad config\"").unwrap_err();
    assert!(err.to_string().contains("bad config"));

    let err = eval_source("abort \"stop here\"").unwrap_err();
    assert!(err.to_string().contains("evaluation aborted"));
    assert!(err.to_string().contains("stop here"));
}

#[test]
fn builtins_attribute_set_exposes_stripped_names() {
    assert_eq!(eval_source("builtins.isAttrs {}").unwrap(), "true");
    assert_eq!(eval_source("builtins.head [ 9 ]").unwrap(), "9");
    assert_eq!(eval_source("builtins.typeOf []").unwrap(), "\"list\"");
    // Unprefixed primops keep their name inside `builtins` too.
    assert_eq!(eval_source("builtins.toString 4").unwrap(), "\"4\"");
    assert_eq!(eval_source("builtins.isNull null").unwrap(), "true");
}

#[test]
fn get_env_reads_the_process_environment() {
    std::env::set_var("MARL_TEST_VALUE", "from-env");
    assert_eq!(
        eval_source("__getEnv \"MARL_TEST_VALUE\"").unwrap(),
        "\"from-env\""
    );
    assert_eq!(eval_source("__getEnv \"MARL_TEST_UNSET\"").unwrap(), "\"\"");
}
