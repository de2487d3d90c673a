//! The IR view the optimiser passes work on.
//!
//! Everything is arena-indexed: functions, instructions and frame variables
//! are stable `u32` indices into module-wide vectors. User lists are kept
//! explicitly on every value so passes can walk def-use chains without
//! relying on the identity of heap nodes.

pub mod analysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Inst(InstId),
    Var(VarId),
    Func(FuncId),
    /// The undefined literal.
    Undefined,
}

/// Instruction kinds. Only the shapes the call-graph analysis inspects are
/// distinguished; everything else is `Other`.
#[derive(Debug, Clone)]
pub enum InstKind {
    /// Create a closure over `function`, capturing `scope` as its
    /// environment.
    CreateClosure { function: FuncId, scope: InstId },
    /// A call site. `target` and `environment` are unbound until the
    /// analysis fills them in.
    Call {
        callee: Operand,
        target: Option<FuncId>,
        environment: Option<InstId>,
        args: Vec<Operand>,
        new_target: Operand,
    },
    /// Store `value` into frame variable `var`; `scope` produces the frame
    /// environment at the store point.
    StoreFrame {
        scope: InstId,
        value: Operand,
        var: VarId,
    },
    /// Load frame variable `var`; `scope` produces the frame environment
    /// at the load point.
    LoadFrame { scope: InstId, var: VarId },
    /// Project the environment out of a closure value.
    GetClosureScope { closure: InstId },
    /// Trusted narrowing cast; the result is its input.
    UnionNarrowTrusted { value: InstId },
    /// Checked cast; the result is its input when the result type admits
    /// objects.
    CheckedTypeCast {
        value: InstId,
        result_can_be_object: bool,
    },
    /// Construction setup (`CreateThis`): uses the closure but cannot leak
    /// it and does not contribute to the call graph.
    CreateThis { closure: InstId },
    /// Materialise an environment. Used as the scope operand of closures.
    CreateScope { parent: Option<InstId> },
    /// Any other instruction; its operands are opaque uses.
    Other { operands: Vec<Operand> },
}

pub struct Instruction {
    pub kind: InstKind,
    /// Function the instruction belongs to.
    pub function: FuncId,
    /// Instructions using this instruction's result.
    pub users: Vec<InstId>,
}

pub struct Variable {
    pub name: String,
    /// Stores and loads referencing the variable.
    pub users: Vec<InstId>,
}

/// Function-level attributes maintained by the analyses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attributes {
    /// In strict mode, every callsite of the function is known (its
    /// closure never escapes).
    pub all_callsites_known_in_strict_mode: bool,
    /// The function has no callsites at all.
    pub unreachable: bool,
}

pub struct Function {
    pub name: String,
    /// The global (top level) function is invoked by the runtime itself.
    pub is_global_scope: bool,
    pub attributes: Attributes,
    /// Instructions in emission order.
    pub insts: Vec<InstId>,
    /// Instructions referencing this function (closure creations and
    /// pre-bound call targets).
    pub users: Vec<InstId>,
    /// Number of users of the parent-scope parameter.
    pub parent_scope_param_users: u32,
    /// Number of users of the new.target parameter.
    pub new_target_param_users: u32,
}

/// A whole-module IR arena.
#[derive(Default)]
pub struct Module {
    functions: Vec<Function>,
    insts: Vec<Instruction>,
    vars: Vec<Variable>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    pub fn add_function(&mut self, name: &str, is_global_scope: bool) -> FuncId {
        self.functions.push(Function {
            name: name.to_string(),
            is_global_scope,
            attributes: Attributes::default(),
            insts: Vec::new(),
            users: Vec::new(),
            parent_scope_param_users: 0,
            new_target_param_users: 0,
        });
        FuncId(self.functions.len() as u32 - 1)
    }

    pub fn add_variable(&mut self, name: &str) -> VarId {
        self.vars.push(Variable {
            name: name.to_string(),
            users: Vec::new(),
        });
        VarId(self.vars.len() as u32 - 1)
    }

    /// Append an instruction to `function`, registering it as a user of
    /// every value its operands reference.
    pub fn add_inst(&mut self, function: FuncId, kind: InstKind) -> InstId {
        let id = InstId(self.insts.len() as u32);
        for operand in operand_list(&kind) {
            self.add_use(id, operand);
        }
        self.insts.push(Instruction {
            kind,
            function,
            users: Vec::new(),
        });
        self.functions[function.0 as usize].insts.push(id);
        id
    }

    fn add_use(&mut self, user: InstId, operand: Operand) {
        match operand {
            Operand::Inst(inst) => self.insts[inst.0 as usize].users.push(user),
            Operand::Var(var) => self.vars[var.0 as usize].users.push(user),
            Operand::Func(func) => self.functions[func.0 as usize].users.push(user),
            Operand::Undefined => {}
        }
    }

    fn remove_use(&mut self, user: InstId, operand: Operand) {
        let users = match operand {
            Operand::Inst(inst) => &mut self.insts[inst.0 as usize].users,
            Operand::Var(var) => &mut self.vars[var.0 as usize].users,
            Operand::Func(func) => &mut self.functions[func.0 as usize].users,
            Operand::Undefined => return,
        };
        if let Some(pos) = users.iter().position(|u| *u == user) {
            users.remove(pos);
        }
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.0 as usize]
    }

    /// A variable is store-once iff exactly one store reaches every load.
    pub fn is_store_once_variable(&self, id: VarId) -> bool {
        let stores = self.vars[id.0 as usize]
            .users
            .iter()
            .filter(|u| matches!(self.inst(**u).kind, InstKind::StoreFrame { .. }))
            .count();
        stores == 1
    }

    /// Bind the target operand of a call. Registers the call as a user of
    /// the function.
    pub fn set_call_target(&mut self, call: InstId, function: FuncId) {
        match &mut self.insts[call.0 as usize].kind {
            InstKind::Call { target, .. } => {
                debug_assert!(target.is_none(), "call target already bound");
                *target = Some(function);
            }
            _ => unreachable!("not a call"),
        }
        self.functions[function.0 as usize].users.push(call);
    }

    /// Bind the environment operand of a call.
    pub fn set_call_environment(&mut self, call: InstId, scope: InstId) {
        match &mut self.insts[call.0 as usize].kind {
            InstKind::Call { environment, .. } => {
                debug_assert!(environment.is_none(), "call environment already bound");
                *environment = Some(scope);
            }
            _ => unreachable!("not a call"),
        }
        self.insts[scope.0 as usize].users.push(call);
    }

    /// Rewrite every use of `old` to use `new` instead. `old` keeps its
    /// operands and stays in the function; dead-code elimination reclaims
    /// it later.
    pub fn replace_all_uses_with(&mut self, old: InstId, new: InstId) {
        let users = std::mem::take(&mut self.insts[old.0 as usize].users);
        for user in &users {
            let kind = &mut self.insts[user.0 as usize].kind;
            rewrite_operands(kind, old, new);
            self.insts[new.0 as usize].users.push(*user);
        }
    }
}

/// All value operands of an instruction, in operand order.
fn operand_list(kind: &InstKind) -> Vec<Operand> {
    match kind {
        InstKind::CreateClosure { function, scope } => {
            vec![Operand::Func(*function), Operand::Inst(*scope)]
        }
        InstKind::Call {
            callee,
            target,
            environment,
            args,
            new_target,
        } => {
            let mut ops = vec![*callee];
            if let Some(target) = target {
                ops.push(Operand::Func(*target));
            }
            if let Some(environment) = environment {
                ops.push(Operand::Inst(*environment));
            }
            ops.extend_from_slice(args);
            ops.push(*new_target);
            ops
        }
        InstKind::StoreFrame { scope, value, var } => {
            vec![Operand::Inst(*scope), *value, Operand::Var(*var)]
        }
        InstKind::LoadFrame { scope, var } => vec![Operand::Inst(*scope), Operand::Var(*var)],
        InstKind::GetClosureScope { closure } => vec![Operand::Inst(*closure)],
        InstKind::UnionNarrowTrusted { value } => vec![Operand::Inst(*value)],
        InstKind::CheckedTypeCast { value, .. } => vec![Operand::Inst(*value)],
        InstKind::CreateThis { closure } => vec![Operand::Inst(*closure)],
        InstKind::CreateScope { parent } => match parent {
            Some(parent) => vec![Operand::Inst(*parent)],
            None => Vec::new(),
        },
        InstKind::Other { operands } => operands.clone(),
    }
}

/// Replace `Inst(old)` with `Inst(new)` in every operand position of `kind`.
fn rewrite_operands(kind: &mut InstKind, old: InstId, new: InstId) {
    let swap = |inst: &mut InstId| {
        if *inst == old {
            *inst = new;
        }
    };
    let swap_op = |op: &mut Operand| {
        if *op == Operand::Inst(old) {
            *op = Operand::Inst(new);
        }
    };
    match kind {
        InstKind::CreateClosure { scope, .. } => swap(scope),
        InstKind::Call {
            callee,
            environment,
            args,
            new_target,
            ..
        } => {
            swap_op(callee);
            if let Some(environment) = environment {
                swap(environment);
            }
            args.iter_mut().for_each(swap_op);
            swap_op(new_target);
        }
        InstKind::StoreFrame { scope, value, .. } => {
            swap(scope);
            swap_op(value);
        }
        InstKind::LoadFrame { scope, .. } => swap(scope),
        InstKind::GetClosureScope { closure } => swap(closure),
        InstKind::UnionNarrowTrusted { value } => swap(value),
        InstKind::CheckedTypeCast { value, .. } => swap(value),
        InstKind::CreateThis { closure } => swap(closure),
        InstKind::CreateScope { parent } => {
            if let Some(parent) = parent {
                swap(parent);
            }
        }
        InstKind::Other { operands } => operands.iter_mut().for_each(swap_op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_lists_track_operands() {
        let mut m = Module::new();
        let f = m.add_function("f", false);
        let outer = m.add_function("outer", true);
        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let create = m.add_inst(
            outer,
            InstKind::CreateClosure {
                function: f,
                scope,
            },
        );
        assert_eq!(m.func(f).users, vec![create]);
        assert_eq!(m.inst(scope).users, vec![create]);
    }

    #[test]
    fn test_replace_all_uses_with() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let other_scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let user = m.add_inst(
            outer,
            InstKind::Other {
                operands: vec![Operand::Inst(scope)],
            },
        );
        m.replace_all_uses_with(scope, other_scope);
        assert!(m.inst(scope).users.is_empty());
        assert_eq!(m.inst(other_scope).users, vec![user]);
        match &m.inst(user).kind {
            InstKind::Other { operands } => {
                assert_eq!(operands[0], Operand::Inst(other_scope));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_store_once_variable() {
        let mut m = Module::new();
        let f = m.add_function("f", false);
        let v = m.add_variable("v");
        let scope = m.add_inst(f, InstKind::CreateScope { parent: None });
        m.add_inst(
            f,
            InstKind::StoreFrame {
                scope,
                value: Operand::Undefined,
                var: v,
            },
        );
        m.add_inst(f, InstKind::LoadFrame { scope, var: v });
        assert!(m.is_store_once_variable(v));
        m.add_inst(
            f,
            InstKind::StoreFrame {
                scope,
                value: Operand::Undefined,
                var: v,
            },
        );
        assert!(!m.is_store_once_variable(v));
    }
}
