//! Call-graph analysis.
//!
//! Propagates created closures to their callsites, binds concrete
//! target/environment operands on calls, and maintains the per-function
//! `all_callsites_known_in_strict_mode` and `unreachable` attributes that
//! the downstream optimisations rely on.

use super::{FuncId, InstId, InstKind, Module, Operand};
use std::collections::HashSet;

/// Run the analysis over every function in the module.
pub fn run_function_analysis(module: &mut Module) {
    for f in module.function_ids().collect::<Vec<_>>() {
        analyze_function_callsites(module, f);
    }
}

/// Set the target/environment operands of `call` if they have not been set
/// yet.
fn register_callsite(m: &mut Module, call: InstId, create: InstId, scope: Option<InstId>) {
    let function = match m.inst(create).kind {
        InstKind::CreateClosure { function, .. } => function,
        _ => unreachable!("create is not a closure creation"),
    };

    let (target_unset, env_unset) = match &m.inst(call).kind {
        InstKind::Call {
            target,
            environment,
            ..
        } => (target.is_none(), environment.is_none()),
        _ => unreachable!("not a call"),
    };

    if target_unset {
        m.set_call_target(call, function);
    }

    // Populate the environment if the function actually uses its parent
    // scope.
    if let Some(scope) = scope {
        if env_unset && m.func(function).parent_scope_param_users > 0 {
            m.set_call_environment(call, scope);
        }
    }
}

/// Whether the call `call`, which uses the closure `c`, may leak it.
fn can_escape_through_call(m: &Module, c: InstId, f: FuncId, call: InstId) -> bool {
    let (callee, args, new_target) = match &m.inst(call).kind {
        InstKind::Call {
            callee,
            args,
            new_target,
            ..
        } => (*callee, args, *new_target),
        _ => unreachable!("not a call"),
    };

    // The call does not actually invoke c, so assume it is leaked.
    if callee != Operand::Inst(c) {
        return true;
    }

    // The closure leaks if it is passed as an argument the callee could
    // observe.
    if args.iter().any(|arg| *arg == Operand::Inst(c)) {
        return true;
    }

    // Passed as new.target, and the function actually uses it.
    if new_target == Operand::Inst(c) && m.func(f).new_target_param_users > 0 {
        return true;
    }

    false
}

/// Find all callsites that could invoke the closure made by `create` and
/// register them. Follows the closure through casts and through store-once
/// frame variables.
fn analyze_create_callable(m: &mut Module, create: InstId) {
    let f = match m.inst(create).kind {
        InstKind::CreateClosure { function, .. } => function,
        _ => unreachable!("create is not a closure creation"),
    };
    let create_scope = match m.inst(create).kind {
        InstKind::CreateClosure { scope, .. } => scope,
        _ => unreachable!(),
    };

    // Worklist of (instruction producing the closure value, instruction
    // producing its scope at that point, if known).
    let mut worklist: Vec<(InstId, Option<InstId>)> = vec![(create, Some(create_scope))];

    // Instruction identity is its arena index; never the hash of a heap
    // node. The set prevents bouncing between loads of the same variable.
    let mut visited: HashSet<InstId> = HashSet::new();

    while let Some((closure_inst, known_scope)) = worklist.pop() {
        if !visited.insert(closure_inst) {
            continue;
        }

        for user in m.inst(closure_inst).users.clone() {
            match m.inst(user).kind.clone() {
                InstKind::Call { callee, .. } => {
                    if can_escape_through_call(m, closure_inst, f, user) {
                        m.func_mut(f).attributes.all_callsites_known_in_strict_mode = false;
                    }
                    if callee == Operand::Inst(closure_inst) {
                        register_callsite(m, user, create, known_scope);
                    }
                }

                // Construction setup cannot leak the closure on its own and
                // does not contribute to the call graph.
                InstKind::CreateThis { .. } => {}

                InstKind::GetClosureScope { .. } => {
                    // If the scope is available, forward it. The projection
                    // becomes dead but is not deleted here; DCE reclaims it.
                    if let Some(scope) = known_scope {
                        m.replace_all_uses_with(user, scope);
                    }
                }

                // Casts produce the same value; follow them.
                InstKind::UnionNarrowTrusted { .. } => {
                    worklist.push((user, known_scope));
                }
                InstKind::CheckedTypeCast {
                    result_can_be_object: true,
                    ..
                } => {
                    worklist.push((user, known_scope));
                }

                InstKind::StoreFrame { scope, var, .. } => {
                    if !m.is_store_once_variable(var) {
                        // Multiple stores, give up on this path.
                        m.func_mut(f).attributes.all_callsites_known_in_strict_mode = false;
                        continue;
                    }

                    // When the store writes into the scope we already track,
                    // the closure's scope at every load is just the scope at
                    // the load point.
                    let propagate_scope = Some(scope) == known_scope;

                    for var_user in m.var(var).users.clone() {
                        if let InstKind::LoadFrame {
                            scope: load_scope, ..
                        } = m.inst(var_user).kind
                        {
                            worklist
                                .push((var_user, if propagate_scope { Some(load_scope) } else { None }));
                        }
                        // Stores are skipped: store-once means they all
                        // store this same closure.
                    }
                }

                // Unknown user; the closure could escape through it.
                _ => {
                    m.func_mut(f).attributes.all_callsites_known_in_strict_mode = false;
                }
            }
        }
    }
}

/// Find and register every callsite of `f` that can be discovered from its
/// closure creations.
fn analyze_function_callsites(m: &mut Module, f: FuncId) {
    // Start from a position of knowing all callsites.
    m.func_mut(f).attributes.all_callsites_known_in_strict_mode = true;

    if m.func(f).is_global_scope {
        // The global function is called by the runtime itself.
        m.func_mut(f).attributes.all_callsites_known_in_strict_mode = false;
    }

    // Users are appended as callsites get registered; index the list.
    let mut i = 0;
    while i < m.func(f).users.len() {
        let user = m.func(f).users[i];
        i += 1;

        match &m.inst(user).kind {
            InstKind::CreateClosure { function, .. } => {
                debug_assert!(
                    *function == f,
                    "function can only be used as the function-code operand"
                );
                analyze_create_callable(m, user);
            }
            // Use as a pre-bound call target; not a leak.
            InstKind::Call { target, .. } => {
                debug_assert!(*target == Some(f), "invalid use of function in a call");
            }
            _ => {
                // Unknown user of the function itself.
                m.func_mut(f).attributes.all_callsites_known_in_strict_mode = false;
            }
        }
    }

    // If all callsites are known and none of the users is a call, the
    // function has no callsites at all.
    if m.func(f).attributes.all_callsites_known_in_strict_mode {
        let any_call = m
            .func(f)
            .users
            .iter()
            .any(|u| matches!(m.inst(*u).kind, InstKind::Call { .. }));
        m.func_mut(f).attributes.unreachable = !any_call;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;

    /// c = CreateClosure(f); call(callee = c)
    #[test]
    fn test_direct_call_binds_target() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        m.func_mut(f).parent_scope_param_users = 1;
        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let call = m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(c),
                target: None,
                environment: None,
                args: Vec::new(),
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);

        match &m.inst(call).kind {
            InstKind::Call {
                target,
                environment,
                ..
            } => {
                assert_eq!(*target, Some(f));
                assert_eq!(*environment, Some(scope));
            }
            _ => unreachable!(),
        }
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
        assert!(!m.func(f).attributes.unreachable);
    }

    /// The environment is left unbound when the function ignores its
    /// parent scope.
    #[test]
    fn test_unused_parent_scope_not_bound() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let call = m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(c),
                target: None,
                environment: None,
                args: Vec::new(),
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);

        match &m.inst(call).kind {
            InstKind::Call { environment, .. } => assert_eq!(*environment, None),
            _ => unreachable!(),
        }
    }

    /// Second run flips no attributes.
    #[test]
    fn test_idempotent() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(c),
                target: None,
                environment: None,
                args: Vec::new(),
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);
        let first = (
            m.func(f).attributes.all_callsites_known_in_strict_mode,
            m.func(f).attributes.unreachable,
        );
        run_function_analysis(&mut m);
        let second = (
            m.func(f).attributes.all_callsites_known_in_strict_mode,
            m.func(f).attributes.unreachable,
        );
        assert_eq!(first, second);
    }
}
