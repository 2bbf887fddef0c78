//! Cell models: named variables, metadata tags and a compiled evaluator.
//!
//! A `Model` is plain data. The sweep driver clones the loaded model once per
//! sweep point and applies its own parameter and state configuration, so no
//! instance is shared across points.

pub mod expr;
pub mod mmt;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use expr::{Expr, Node};

pub use expr::Slots;

pub use mmt::load;

/// Metadata key under which ontology annotations are stored.
pub const OXMETA: &str = "oxmeta";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Time,
    Pace,
}

impl Binding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "time" => Some(Binding::Time),
            "pace" => Some(Binding::Pace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    State,
    Bound(Binding),
    Constant,
    Intermediate,
}

#[derive(Clone, Debug)]
pub struct Variable {
    qname: String,
    name: String,
    component: String,
    parent: Option<usize>,
    kind: VarKind,
    rhs: Expr,
    node: Node,
    unit: Option<String>,
    label: Option<String>,
    meta: BTreeMap<String, String>,
}

impl Variable {
    pub fn qname(&self) -> &str {
        &self.qname
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }

    pub fn is_state(&self) -> bool {
        self.kind == VarKind::State
    }

    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Right-hand side: the derivative for states, the defining expression otherwise.
    pub fn rhs(&self) -> &Expr {
        &self.rhs
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn oxmeta(&self) -> Option<&str> {
        self.meta(OXMETA)
    }
}

/// One variable declaration as read from a model description, before
/// names are resolved.
#[derive(Clone, Debug)]
pub struct Declaration {
    pub line: usize,
    pub component: String,
    pub name: String,
    pub parent: Option<usize>,
    pub is_state: bool,
    pub rhs: Expr,
    pub binding: Option<Binding>,
    pub unit: Option<String>,
    pub label: Option<String>,
    pub meta: BTreeMap<String, String>,
}

/// A failed model build, pointing at the offending declaration line.
#[derive(Debug)]
pub struct BuildError {
    pub line: usize,
    pub message: String,
}

impl BuildError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Model {
    name: String,
    meta: BTreeMap<String, String>,
    source: PathBuf,
    variables: Vec<Variable>,
    index: HashMap<String, usize>,
    states: Vec<usize>,
    state_values: Vec<f64>,
    order: Vec<usize>,
}

impl Model {
    /// Resolves, orders and compiles a list of declarations.
    ///
    /// `initial` maps state qnames to their initial values; every state must
    /// have exactly one and no other variable may appear in it.
    pub fn build(
        name: impl Into<String>,
        meta: BTreeMap<String, String>,
        source: impl Into<PathBuf>,
        decls: Vec<Declaration>,
        initial: &[(usize, String, f64)],
    ) -> std::result::Result<Model, BuildError> {
        let mut variables: Vec<Variable> = Vec::with_capacity(decls.len());
        let mut index = HashMap::new();
        for (i, d) in decls.iter().enumerate() {
            let qname = match d.parent {
                Some(p) if p < i => format!("{}.{}", variables[p].qname, d.name),
                Some(_) => return Err(BuildError::new(d.line, "nested variable declared before its parent")),
                None => format!("{}.{}", d.component, d.name),
            };
            if index.insert(qname.clone(), i).is_some() {
                return Err(BuildError::new(d.line, format!("duplicate variable {qname}")));
            }
            let kind = if d.is_state {
                if d.binding.is_some() {
                    return Err(BuildError::new(d.line, format!("state {qname} cannot be bound")));
                }
                VarKind::State
            } else if let Some(b) = d.binding {
                VarKind::Bound(b)
            } else {
                let mut names = Vec::new();
                d.rhs.names(&mut names);
                if names.is_empty() {
                    VarKind::Constant
                } else {
                    VarKind::Intermediate
                }
            };
            variables.push(Variable {
                qname,
                name: d.name.clone(),
                component: d.component.clone(),
                parent: d.parent,
                kind,
                rhs: d.rhs.clone(),
                node: Node::Num(f64::NAN),
                unit: d.unit.clone(),
                label: d.label.clone(),
                meta: d.meta.clone(),
            });
        }

        // compile every right-hand side against the enclosing scopes
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); variables.len()];
        for i in 0..variables.len() {
            let mut used = Vec::new();
            let node = {
                let vars = &variables;
                let index = &index;
                let mut resolve = |n: &str| {
                    let found = resolve_name(vars, index, i, n);
                    if let Some(j) = found {
                        used.push(j);
                    }
                    found
                };
                if matches!(variables[i].kind, VarKind::Bound(_)) {
                    Node::Num(0.0)
                } else {
                    variables[i]
                        .rhs
                        .compile(&mut resolve)
                        .map_err(|m| BuildError::new(decls[i].line, format!("{}: {m}", variables[i].qname)))?
                }
            };
            variables[i].node = node;
            deps[i] = used;
        }

        let states: Vec<usize> = (0..variables.len())
            .filter(|&i| variables[i].kind == VarKind::State)
            .collect();
        let mut state_values = vec![f64::NAN; states.len()];
        for (line, qname, value) in initial {
            let Some(&i) = index.get(qname) else {
                return Err(BuildError::new(*line, format!("initial value for unknown variable {qname}")));
            };
            let Some(pos) = states.iter().position(|&s| s == i) else {
                return Err(BuildError::new(*line, format!("{qname} is not a state variable")));
            };
            state_values[pos] = *value;
        }
        for (pos, &i) in states.iter().enumerate() {
            if state_values[pos].is_nan() {
                return Err(BuildError::new(
                    decls[i].line,
                    format!("state {} has no initial value", variables[i].qname),
                ));
            }
        }

        let order = evaluation_order(&variables, &deps)
            .map_err(|i| BuildError::new(decls[i].line, format!("cyclical reference involving {}", variables[i].qname)))?;

        Ok(Model {
            name: name.into(),
            meta,
            source: source.into(),
            variables,
            index,
            states,
            state_values,
            order,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Path of the description this model was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Variables in declared order; nested ones are included when `deep`.
    pub fn variables(&self, deep: bool) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(move |v| deep || !v.is_nested())
    }

    pub fn get(&self, qname: &str) -> Option<&Variable> {
        self.index.get(qname).map(|&i| &self.variables[i])
    }

    fn require(&self, qname: &str) -> Result<usize> {
        self.index.get(qname).copied().ok_or_else(|| Error::UnknownVariable {
            qname: qname.to_string(),
        })
    }

    /// Number of slots in an evaluation buffer.
    pub fn slot_count(&self) -> usize {
        self.variables.len()
    }

    pub fn slot_of(&self, qname: &str) -> Option<usize> {
        self.index.get(qname).copied()
    }

    pub fn state(&self) -> &[f64] {
        &self.state_values
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|&i| self.variables[i].qname())
    }

    pub fn state_index(&self, qname: &str) -> Option<usize> {
        let i = *self.index.get(qname)?;
        self.states.iter().position(|&s| s == i)
    }

    pub fn set_state(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.states.len() {
            return Err(Error::InvalidConfig(format!(
                "state vector has {} values, model {} has {} states",
                values.len(),
                self.name,
                self.states.len()
            )));
        }
        self.state_values.copy_from_slice(values);
        Ok(())
    }

    /// Replaces a non-state variable by a literal value.
    pub fn set_value(&mut self, qname: &str, value: f64) -> Result<()> {
        let i = self.require(qname)?;
        let var = &mut self.variables[i];
        if var.is_state() {
            return Err(Error::StateNotSettable {
                qname: qname.to_string(),
            });
        }
        var.kind = VarKind::Constant;
        var.rhs = Expr::number(value);
        var.node = Node::Num(value);
        Ok(())
    }

    /// Value of `qname` at the current state, with time and pacing at zero.
    pub fn eval(&self, qname: &str) -> Result<f64> {
        let i = self.require(qname)?;
        let mut values = self.slots();
        self.evaluate(0.0, 0.0, &self.state_values, &mut values);
        Ok(values.get(i))
    }

    /// Fills `values` with every variable at time `t`, pacing level `pace`
    /// and the given state vector.
    pub fn evaluate(&self, t: f64, pace: f64, state: &[f64], values: &mut Slots) {
        for (pos, &i) in self.states.iter().enumerate() {
            values.set(i, state[pos]);
        }
        for &i in &self.order {
            let v = match self.variables[i].kind {
                VarKind::Bound(Binding::Time) => t,
                VarKind::Bound(Binding::Pace) => pace,
                _ => self.variables[i].node.eval(values),
            };
            values.set(i, v);
        }
    }

    /// An evaluation buffer sized for this model.
    pub fn slots(&self) -> Slots {
        Slots::new(self.slot_count())
    }

    /// State derivatives from an evaluation buffer filled by [`Model::evaluate`].
    pub fn derivatives(&self, values: &Slots, out: &mut [f64]) {
        for (pos, &i) in self.states.iter().enumerate() {
            out[pos] = self.variables[i].node.eval(values);
        }
    }

    pub fn bound_variable(&self, binding: Binding) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.kind == VarKind::Bound(binding))
    }

    /// Every variable carrying `tag` as its oxmeta annotation.
    pub fn tagged(&self, tag: &str, deep: bool) -> Vec<&Variable> {
        self.variables(deep)
            .filter(|v| v.oxmeta() == Some(tag))
            .collect()
    }

    /// Canonical qname of the single variable annotated with `tag`.
    pub fn find_by_tag(&self, tag: &str, deep: bool) -> Result<&str> {
        let matches = self.tagged(tag, deep);
        match matches.as_slice() {
            [] => Err(Error::UnresolvedTaggedVariable {
                tag: tag.to_string(),
            }),
            [v] => Ok(v.qname()),
            many => Err(Error::AmbiguousTag {
                tag: tag.to_string(),
                matches: many.iter().map(|v| v.qname().to_string()).collect(),
            }),
        }
    }
}

/// Nested children of the variable itself and of each enclosing parent are
/// searched first, then the component, then fully qualified names.
fn resolve_name(
    vars: &[Variable],
    index: &HashMap<String, usize>,
    owner: usize,
    name: &str,
) -> Option<usize> {
    let mut scope = Some(owner);
    while let Some(s) = scope {
        if let Some(&j) = index.get(&format!("{}.{}", vars[s].qname, name)) {
            return Some(j);
        }
        scope = vars[s].parent;
    }
    if let Some(&j) = index.get(&format!("{}.{}", vars[owner].component, name)) {
        return Some(j);
    }
    index.get(name).copied()
}

/// Topological order over non-state variables. States are inputs; their
/// derivative expressions are evaluated afterwards, so they never form
/// dependency edges. Returns the index of a variable on a cycle on failure.
fn evaluation_order(vars: &[Variable], deps: &[Vec<usize>]) -> std::result::Result<Vec<usize>, usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks = vec![Mark::New; vars.len()];
    let mut order = Vec::with_capacity(vars.len());
    for root in 0..vars.len() {
        if vars[root].kind == VarKind::State || marks[root] == Mark::Done {
            continue;
        }
        // iterative DFS: (variable, next dependency to visit)
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Active;
        while let Some(top) = stack.last_mut() {
            let v = top.0;
            if let Some(&d) = deps[v].get(top.1) {
                top.1 += 1;
                if vars[d].kind == VarKind::State {
                    continue;
                }
                match marks[d] {
                    Mark::Done => {}
                    Mark::Active => return Err(d),
                    Mark::New => {
                        marks[d] = Mark::Active;
                        stack.push((d, 0));
                    }
                }
            } else {
                marks[v] = Mark::Done;
                order.push(v);
                stack.pop();
            }
        }
    }
    Ok(order)
}
