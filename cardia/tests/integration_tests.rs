use cardia::mmt::{parse_expression, Expr, Model, Precision, SubstMap, UnitMode, Variable};
use std::io::Write;

/// Builds a small two-component model with a voltage state and a gated
/// current, the shape a cardiac cell model file would produce.
fn cell_model() -> Model {
    let model = Model::new("cell");
    model.set_time_unit(Some(cardia::mmt::units::millisecond()));

    let membrane = model.add_component("membrane");
    let v = membrane.add_variable("V", Some(cardia::mmt::units::millivolt()));
    v.promote_to_state(-84.0);

    let ina = model.add_component("ina");
    ina.add_alias("Vm", &v);
    let e_na = ina.add_variable("ENa", Some(cardia::mmt::units::millivolt()));
    e_na.set_rhs(Expr::number_with_unit(
        50.0,
        Some(cardia::mmt::units::millivolt()),
    ));
    let g_na = ina.add_variable("gNa", Some(cardia::mmt::parse_unit("mS/uF").unwrap()));
    g_na.set_rhs(Expr::number_with_unit(
        16.0,
        Some(cardia::mmt::parse_unit("mS/uF").unwrap()),
    ));
    let i_na = ina.add_variable("INa", Some(cardia::mmt::parse_unit("A/F").unwrap()));
    let rhs = parse_expression("gNa * (Vm - ENa)", Some(&ina)).unwrap();
    i_na.set_rhs(rhs);

    model
}

fn var(model: &Model, qname: &str) -> Variable {
    model.variable(qname).unwrap()
}

#[test]
fn model_equations_parse_validate_and_evaluate() {
    let model = cell_model();
    let i_na = var(&model, "ina.INa");
    let rhs = i_na.rhs().unwrap();
    rhs.validate().unwrap();

    // INa = gNa * (V - ENa) = 16 * (-84 - 50)
    let value = rhs.eval(None, Precision::Double).unwrap();
    assert_eq!(value, 16.0 * (-84.0 - 50.0));
}

#[test]
fn model_equations_unit_check() {
    let model = cell_model();
    let rhs = var(&model, "ina.INa").rhs().unwrap();

    // mS/uF * mV comes out as A/F.
    let unit = rhs.eval_unit(UnitMode::Strict).unwrap().unwrap();
    assert_eq!(unit, cardia::mmt::parse_unit("A/F").unwrap());

    let dot = Expr::derivative(Expr::name(&var(&model, "membrane.V"))).unwrap();
    let unit = dot.eval_unit(UnitMode::Strict).unwrap().unwrap();
    assert_eq!(unit, cardia::mmt::parse_unit("mV/ms").unwrap());
}

#[test]
fn rendering_round_trips_through_the_parser() {
    let model = cell_model();
    let ina = model.component("ina").unwrap();
    let rhs = var(&model, "ina.INa").rhs().unwrap();

    let local = rhs.code(Some(&ina));
    assert_eq!(local, "gNa * (Vm - ENa)");
    let qualified = rhs.code(None);
    assert_eq!(qualified, "ina.gNa * (membrane.V - ina.ENa)");

    for code in [local, qualified] {
        let reparsed = parse_expression(&code, Some(&ina)).unwrap();
        assert_eq!(reparsed, rhs);
    }
}

#[test]
fn derivatives_of_model_equations() {
    let model = cell_model();
    let ina = model.component("ina").unwrap();
    let v = var(&model, "membrane.V");
    let rhs = var(&model, "ina.INa").rhs().unwrap();

    // d(gNa * (V - ENa))/dV = gNa * 1, with the 1 kept for units.
    let derivative = rhs.partial_derivative(&Expr::name(&v)).unwrap();
    let mut subst = SubstMap::new();
    subst.insert(Expr::name(&v), Expr::number(-84.0));
    let slope = derivative.eval(Some(&subst), Precision::Double).unwrap();
    assert_eq!(slope, 16.0);

    // Rendering the derivative still produces valid surface syntax.
    let code = derivative.code(Some(&ina));
    let reparsed = parse_expression(&code, Some(&ina)).unwrap();
    assert_eq!(reparsed, derivative);
}

#[test]
fn expansion_inlines_constants_but_not_states() {
    let model = cell_model();
    let rhs = var(&model, "ina.INa").rhs().unwrap();
    let expanded = rhs.clone_with(None, true, None);

    // gNa and ENa expand to their defining numbers, V stays.
    let expected = parse_expression(
        "16 [mS/uF] * (Vm - 50 [mV])",
        Some(&model.component("ina").unwrap()),
    )
    .unwrap();
    assert_eq!(expanded, expected);
}

#[test]
fn clone_preserves_identity_invariants() {
    let model = cell_model();
    let rhs = var(&model, "ina.INa").rhs().unwrap();
    let clone = rhs.clone_with(None, false, None);
    assert_eq!(rhs, clone);
    assert_eq!(rhs.polish(), clone.polish());

    let mut set = std::collections::HashSet::new();
    set.insert(rhs);
    assert!(set.contains(&clone));
}

#[test]
fn unit_errors_carry_positions() {
    let model = cell_model();
    let ina = model.component("ina").unwrap();
    let expr = parse_expression("gNa +\n  ENa", Some(&ina)).unwrap();
    let error = expr.eval_unit(UnitMode::Strict).unwrap_err();
    assert!(error.message().contains("requires equal units"));
    let span = error.span().unwrap();
    assert_eq!(span.start().line(), 0);
}

#[test]
fn numerical_errors_name_the_variable() {
    let model = Model::new("m");
    let c = model.add_component("c");
    let d = c.add_variable("d", None);
    d.set_rhs(parse_expression("1 / 0", Some(&c)).unwrap());
    let user = c.add_variable("u", None);
    user.set_rhs(parse_expression("d + 1", Some(&c)).unwrap());

    let error = Expr::name(&user)
        .eval(None, Precision::Double)
        .expect_err("division by zero must surface");
    assert!(error.message().contains("Division by zero"), "{error}");
    assert!(error.message().contains("c.d"), "{error}");
}

#[test]
fn expressions_can_be_read_from_files() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# a comment line").unwrap();
    writeln!(file, "1 [mV] + 2 [mV]").unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let expr = parse_expression(text.trim(), None).unwrap();
    assert_eq!(expr.eval(None, Precision::Double).unwrap(), 3.0);
    assert_eq!(
        expr.eval_unit(UnitMode::Strict).unwrap().unwrap(),
        cardia::mmt::units::millivolt()
    );
}

#[test]
fn validation_smoke_test_across_the_api() {
    let model = cell_model();
    let ina = model.component("ina").unwrap();

    // A valid tree validates, twice (cached).
    let expr = parse_expression("sqrt(gNa * gNa)", Some(&ina)).unwrap();
    expr.validate().unwrap();
    expr.validate().unwrap();

    // A sentinel from a context-free parse does not.
    let unresolved = parse_expression("sqrt(gNa)", None).unwrap();
    assert!(unresolved.validate().is_err());
}
