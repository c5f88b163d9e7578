use crate::error::Error;
use crate::model::node::{NodeBuilder, NodeSet, ResourceShape};
use crate::scheduler::host_expression::{expand_host_expression, HostExpression};
use crate::scheduler::tests::platform_mock::generate_mock_platform;
use crate::scheduler::tests::setup_for_tests;

#[test]
fn test_parse_expression_kinds() {
    setup_for_tests();
    assert!(matches!(HostExpression::parse("node01,node02").unwrap(), HostExpression::List(names) if names.len() == 2));
    assert!(matches!(HostExpression::parse("node01 node02:node03").unwrap(), HostExpression::List(names) if names.len() == 3));
    assert!(matches!(HostExpression::parse("CLASS:batch").unwrap(), HostExpression::Class(class) if class.as_ref() == "batch"));
    assert!(matches!(HostExpression::parse("node0[1-3]").unwrap(), HostExpression::List(_)));
    assert!(matches!(HostExpression::parse("node.*").unwrap(), HostExpression::Regex(_)));

    let HostExpression::Range(names) = HostExpression::parse("R:node[08-10,12]x,gpu[1-2]").unwrap() else {
        panic!("range expression expected");
    };
    let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    assert_eq!(names, vec!["node08x", "node09x", "node10x", "node12x", "gpu1", "gpu2"]);
}

#[test]
fn test_parse_errors() {
    setup_for_tests();
    for expression in ["", "   ", "CLASS:", "R:node[3-1]", "R:node[01-02", "R:node[a-b]", "node(01"] {
        assert!(
            matches!(HostExpression::parse(expression), Err(Error::HostExpressionInvalid { .. })),
            "'{}' should be rejected",
            expression
        );
    }
}

#[test]
fn test_expand_against_platform() {
    setup_for_tests();
    let mut platform = generate_mock_platform(4, 8);
    platform
        .add_node(NodeBuilder::new("gpu01", ResourceShape::procs(8)).class("gpu"))
        .unwrap();

    assert_eq!(expand_host_expression(&platform, "node02,node04", None).unwrap(), NodeSet::from_iter([1, 3]));
    assert_eq!(expand_host_expression(&platform, "node02,node02", None).unwrap(), NodeSet::from_iter([1]));
    assert_eq!(expand_host_expression(&platform, "R:node[02-03]", None).unwrap(), NodeSet::from_iter([1, 2]));
    assert_eq!(expand_host_expression(&platform, "CLASS:gpu", None).unwrap(), NodeSet::from_iter([4]));
    assert_eq!(expand_host_expression(&platform, "CLASS:batch", None).unwrap(), NodeSet::from_iter([0, 1, 2, 3]));
    // Brackets only expand with the range prefix
    assert!(expand_host_expression(&platform, "node0[13]", None).is_err());
    assert_eq!(expand_host_expression(&platform, "node0(1|3)", None).unwrap(), NodeSet::from_iter([0, 2]));
    // Regular expressions match whole names
    assert!(expand_host_expression(&platform, "ode0.*", None).is_err());

    assert_eq!(expand_host_expression(&platform, "CLASS:batch", Some(2)).unwrap(), NodeSet::from_iter([0, 1]));

    assert!(matches!(
        expand_host_expression(&platform, "node01,node42", None),
        Err(Error::HostExpressionInvalid { .. })
    ));
    assert!(matches!(
        expand_host_expression(&platform, "CLASS:bigmem", None),
        Err(Error::HostExpressionInvalid { .. })
    ));
}
