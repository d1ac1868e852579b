//! The model container: a model groups components, components group
//! variables, and every variable owns the expression tree defining its
//! value. Expressions refer back to variables through weak handles, keeping
//! ownership strictly one-way.

use crate::mmt::expression::Expr;
use crate::mmt::unit::{Unit, UnitMode};
use parking_lot::RwLock;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Model {
    data: Arc<ModelData>,
}

struct ModelData {
    name: String,
    time_unit: RwLock<Option<Unit>>,
    components: RwLock<Vec<Component>>,
}

impl Clone for Model {
    fn clone(&self) -> Self {
        Model {
            data: self.data.clone(),
        }
    }
}

impl Model {
    pub fn new(name: impl Into<String>) -> Model {
        Model {
            data: Arc::new(ModelData {
                name: name.into(),
                time_unit: RwLock::new(None),
                components: RwLock::new(vec![]),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.data.name.clone()
    }

    pub fn add_component(&self, name: impl Into<String>) -> Component {
        let component = Component {
            data: Arc::new(ComponentData {
                name: name.into(),
                model: Arc::downgrade(&self.data),
                variables: RwLock::new(vec![]),
                aliases: RwLock::new(vec![]),
            }),
        };
        self.data.components.write().push(component.clone());
        component
    }

    pub fn component(&self, name: &str) -> Option<Component> {
        self.data
            .components
            .read()
            .iter()
            .find(|c| c.data.name == name)
            .cloned()
    }

    pub fn components(&self) -> Vec<Component> {
        self.data.components.read().clone()
    }

    /// Looks up a variable by its fully qualified dotted name, descending
    /// into nested variables.
    pub fn variable(&self, qname: &str) -> Option<Variable> {
        let mut parts = qname.split('.');
        let component = self.component(parts.next()?)?;
        let mut var = component.variable(parts.next()?)?;
        for part in parts {
            var = var.nested(part)?;
        }
        Some(var)
    }

    pub fn set_time_unit(&self, unit: Option<Unit>) {
        *self.data.time_unit.write() = unit;
    }

    /// The unit of the model's time variable. In strict mode an unset time
    /// unit reads as dimensionless.
    pub fn time_unit(&self, mode: UnitMode) -> Option<Unit> {
        let unit = self.data.time_unit.read().clone();
        match mode {
            UnitMode::Strict => unit.or_else(|| Some(Unit::dimensionless())),
            UnitMode::Tolerant => unit,
        }
    }

    /// Returns a binding label not currently used by any variable.
    pub fn unused_label(&self) -> String {
        let labels: Vec<String> = self
            .all_variables()
            .iter()
            .filter_map(Variable::binding)
            .collect();
        let mut n = 0;
        loop {
            let candidate = format!("unused_{n}");
            if !labels.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn all_variables(&self) -> Vec<Variable> {
        let mut out = vec![];
        for component in self.data.components.read().iter() {
            for var in component.data.variables.read().iter() {
                var.collect(&mut out);
            }
        }
        out
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Display for Model {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.data.name)
    }
}

/// A named grouping of variables. Components also carry aliases: local
/// shorthands for variables defined in other components, used by the
/// renderer.
pub struct Component {
    data: Arc<ComponentData>,
}

struct ComponentData {
    name: String,
    model: Weak<ModelData>,
    variables: RwLock<Vec<Variable>>,
    aliases: RwLock<Vec<(String, Variable)>>,
}

impl Clone for Component {
    fn clone(&self) -> Self {
        Component {
            data: self.data.clone(),
        }
    }
}

impl Component {
    pub fn name(&self) -> String {
        self.data.name.clone()
    }

    pub fn model(&self) -> Option<Model> {
        self.data.model.upgrade().map(|data| Model { data })
    }

    pub fn add_variable(&self, name: impl Into<String>, unit: Option<Unit>) -> Variable {
        let variable = Variable::allocate(name, unit, Arc::downgrade(&self.data), None);
        self.data.variables.write().push(variable.clone());
        variable
    }

    pub fn variable(&self, name: &str) -> Option<Variable> {
        self.data
            .variables
            .read()
            .iter()
            .find(|v| v.data.name == name)
            .cloned()
    }

    pub fn add_alias(&self, alias: impl Into<String>, variable: &Variable) {
        self.data
            .aliases
            .write()
            .push((alias.into(), variable.clone()));
    }

    /// The variable a local alias refers to, if the alias exists.
    pub fn alias(&self, alias: &str) -> Option<Variable> {
        self.data
            .aliases
            .read()
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, variable)| variable.clone())
    }

    /// The local alias this component defines for the given variable, if
    /// any.
    pub fn alias_for(&self, variable: &Variable) -> Option<String> {
        self.data
            .aliases
            .read()
            .iter()
            .find(|(_, v)| v == variable)
            .map(|(alias, _)| alias.clone())
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.data.name)
    }
}

/// A model variable.
///
/// Variables are handles: cloning is cheap and clones refer to the same
/// underlying variable. Identity (used by expression equality and the
/// canonical form) is a process-unique numeric id, so two variables that
/// happen to share a spelling stay distinguishable.
pub struct Variable {
    data: Arc<VariableData>,
}

struct VariableData {
    id: u64,
    name: String,
    component: Weak<ComponentData>,
    parent: Option<Weak<VariableData>>,
    unit: Option<Unit>,
    state: RwLock<Option<f64>>,
    binding: RwLock<Option<String>>,
    rhs: RwLock<Option<Expr>>,
    children: RwLock<Vec<Variable>>,
}

impl Clone for Variable {
    fn clone(&self) -> Self {
        Variable {
            data: self.data.clone(),
        }
    }
}

impl Variable {
    fn allocate(
        name: impl Into<String>,
        unit: Option<Unit>,
        component: Weak<ComponentData>,
        parent: Option<Weak<VariableData>>,
    ) -> Variable {
        Variable {
            data: Arc::new(VariableData {
                id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                component,
                parent,
                unit,
                state: RwLock::new(None),
                binding: RwLock::new(None),
                rhs: RwLock::new(None),
                children: RwLock::new(vec![]),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn name(&self) -> String {
        self.data.name.clone()
    }

    /// The fully qualified dotted name, optionally shortened relative to a
    /// component.
    pub fn qname(&self, relative_to: Option<&Component>) -> String {
        let mut parts = vec![self.data.name.clone()];
        let mut parent = self.data.parent.clone();
        while let Some(p) = parent.and_then(|weak| weak.upgrade()) {
            parts.push(p.name.clone());
            parent = p.parent.clone();
        }
        let in_component = matches!(
            (relative_to, self.component()),
            (Some(c), Some(own)) if *c == own
        );
        if !in_component {
            if let Some(component) = self.component() {
                parts.push(component.name());
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// The declared unit. In strict mode an undeclared unit reads as
    /// dimensionless.
    pub fn unit(&self, mode: UnitMode) -> Option<Unit> {
        match mode {
            UnitMode::Strict => self
                .data
                .unit
                .clone()
                .or_else(|| Some(Unit::dimensionless())),
            UnitMode::Tolerant => self.data.unit.clone(),
        }
    }

    pub fn is_state(&self) -> bool {
        self.data.state.read().is_some()
    }

    /// A variable is constant if it is neither a state nor bound, and its
    /// defining expression (if any) depends only on constants.
    pub fn is_constant(&self) -> bool {
        if self.is_state() || self.is_bound() {
            return false;
        }
        match self.rhs() {
            Some(rhs) => rhs.is_constant(),
            None => true,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.data.binding.read().is_some()
    }

    pub fn is_nested(&self) -> bool {
        self.data.parent.is_some()
    }

    pub fn binding(&self) -> Option<String> {
        self.data.binding.read().clone()
    }

    /// Binds the variable to an external input, or clears the binding.
    pub fn set_binding(&self, label: Option<String>) {
        *self.data.binding.write() = label;
    }

    /// Turns the variable into a state with the given current value.
    pub fn promote_to_state(&self, value: f64) {
        *self.data.state.write() = Some(value);
    }

    pub fn set_state_value(&self, value: f64) {
        let mut state = self.data.state.write();
        debug_assert!(state.is_some(), "set_state_value on a non-state");
        *state = Some(value);
    }

    pub fn state_value(&self) -> Option<f64> {
        *self.data.state.read()
    }

    pub fn set_rhs(&self, rhs: Expr) {
        *self.data.rhs.write() = Some(rhs);
    }

    /// The defining right-hand side. For states this is the right-hand side
    /// of the dot() equation; the current value is read with
    /// `state_value()`.
    pub fn rhs(&self) -> Option<Expr> {
        self.data.rhs.read().clone()
    }

    pub fn component(&self) -> Option<Component> {
        let mut data = self.data.clone();
        while let Some(parent) = data.parent.as_ref().and_then(Weak::upgrade) {
            data = parent;
        }
        data.component.upgrade().map(|data| Component { data })
    }

    pub fn model(&self) -> Option<Model> {
        self.component().and_then(|c| c.model())
    }

    pub fn add_nested_variable(&self, name: impl Into<String>, unit: Option<Unit>) -> Variable {
        let variable = Variable::allocate(
            name,
            unit,
            self.data.component.clone(),
            Some(Arc::downgrade(&self.data)),
        );
        self.data.children.write().push(variable.clone());
        variable
    }

    pub fn nested(&self, name: &str) -> Option<Variable> {
        self.data
            .children
            .read()
            .iter()
            .find(|v| v.data.name == name)
            .cloned()
    }

    fn collect(&self, out: &mut Vec<Variable>) {
        out.push(self.clone());
        for child in self.data.children.read().iter() {
            child.collect(out);
        }
    }

    pub(crate) fn downgrade(&self) -> VarRef {
        VarRef {
            data: Arc::downgrade(&self.data),
            id: self.data.id,
            name: self.data.name.clone(),
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qname(None))
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Variable {}#{}>", self.qname(None), self.data.id)
    }
}

/// A weak variable handle as stored inside `Name` expressions. The model
/// container owns the variable; dropping the model invalidates the handle,
/// which validation and evaluation report as errors.
#[derive(Clone)]
pub struct VarRef {
    data: Weak<VariableData>,
    id: u64,
    name: String,
}

impl VarRef {
    pub fn upgrade(&self) -> Option<Variable> {
        self.data.upgrade().map(|data| Variable { data })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The variable's short name as captured at creation; usable even when
    /// the model is gone.
    pub fn name(&self) -> String {
        self.name.clone()
    }
}

impl PartialEq for VarRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VarRef {}

impl std::fmt::Debug for VarRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<VarRef {}#{}>", self.name, self.id)
    }
}
