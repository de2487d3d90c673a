//! In-process tests for the call-graph analysis.
//!
//! These drive the IR builder and the pass directly through the public
//! API, mirroring how the optimiser pipeline invokes it.

use jade::ir::analysis::run_function_analysis;
use jade::ir::{FuncId, InstId, InstKind, Module, Operand};

fn new_call(callee: InstId) -> InstKind {
    InstKind::Call {
        callee: Operand::Inst(callee),
        target: None,
        environment: None,
        args: Vec::new(),
        new_target: Operand::Undefined,
    }
}

fn call_target(m: &Module, call: InstId) -> Option<FuncId> {
    match &m.inst(call).kind {
        InstKind::Call { target, .. } => *target,
        _ => unreachable!("not a call"),
    }
}

fn call_environment(m: &Module, call: InstId) -> Option<InstId> {
    match &m.inst(call).kind {
        InstKind::Call { environment, .. } => *environment,
        _ => unreachable!("not a call"),
    }
}

mod direct_calls {
    use super::*;

    /// c = CreateClosure(f); call(callee = c): the call gets a concrete
    /// target, and the environment when the function uses its parent
    /// scope.
    #[test]
    fn test_call_binds_target_and_environment() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        m.func_mut(f).parent_scope_param_users = 1;

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let call = m.add_inst(outer, new_call(c));

        run_function_analysis(&mut m);

        assert_eq!(call_target(&m, call), Some(f));
        assert_eq!(call_environment(&m, call), Some(scope));
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
        assert!(!m.func(f).attributes.unreachable);
    }

    /// The global function is invoked by the runtime, so its callsites
    /// are never all known.
    #[test]
    fn test_global_scope_is_never_fully_known() {
        let mut m = Module::new();
        let global = m.add_function("global", true);
        run_function_analysis(&mut m);
        assert!(!m.func(global).attributes.all_callsites_known_in_strict_mode);
    }

    /// The closure flows through trusted casts before the call.
    #[test]
    fn test_closure_followed_through_casts() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let narrowed = m.add_inst(outer, InstKind::UnionNarrowTrusted { value: c });
        let cast = m.add_inst(
            outer,
            InstKind::CheckedTypeCast {
                value: narrowed,
                result_can_be_object: true,
            },
        );
        let call = m.add_inst(outer, new_call(cast));

        run_function_analysis(&mut m);

        assert_eq!(call_target(&m, call), Some(f));
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
    }

    /// A cast that cannot produce an object loses track of the closure.
    #[test]
    fn test_non_object_cast_gives_up() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::CheckedTypeCast {
                value: c,
                result_can_be_object: false,
            },
        );

        run_function_analysis(&mut m);

        assert!(!m.func(f).attributes.all_callsites_known_in_strict_mode);
    }
}

mod escapes {
    use super::*;

    /// c = CreateClosure(f); call(callee = g, args = [c]): f escapes and
    /// the call target is left alone.
    #[test]
    fn test_escape_via_argument() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let g = m.add_function("g", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let cf = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let cg = m.add_inst(outer, InstKind::CreateClosure { function: g, scope });
        let call = m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(cg),
                target: None,
                environment: None,
                args: vec![Operand::Inst(cf)],
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);

        assert!(!m.func(f).attributes.all_callsites_known_in_strict_mode);
        // The call still binds to g, which it actually invokes.
        assert_eq!(call_target(&m, call), Some(g));
    }

    /// Passing the closure as new.target only counts when the function
    /// observes new.target.
    #[test]
    fn test_new_target_escape_depends_on_usage() {
        for (users, expect_known) in [(0u32, true), (1u32, false)] {
            let mut m = Module::new();
            let outer = m.add_function("outer", true);
            let f = m.add_function("f", false);
            m.func_mut(f).new_target_param_users = users;

            let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
            let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
            m.add_inst(
                outer,
                InstKind::Call {
                    callee: Operand::Inst(c),
                    target: None,
                    environment: None,
                    args: Vec::new(),
                    new_target: Operand::Inst(c),
                },
            );

            run_function_analysis(&mut m);
            assert_eq!(
                m.func(f).attributes.all_callsites_known_in_strict_mode,
                expect_known
            );
        }
    }

    /// An unrecognised user of the closure is assumed to leak it.
    #[test]
    fn test_unknown_user_escapes() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::Other {
                operands: vec![Operand::Inst(c)],
            },
        );

        run_function_analysis(&mut m);
        assert!(!m.func(f).attributes.all_callsites_known_in_strict_mode);
    }

    /// Construction setup uses the closure without leaking it.
    #[test]
    fn test_construction_setup_does_not_escape() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(outer, InstKind::CreateThis { closure: c });
        m.add_inst(outer, new_call(c));

        run_function_analysis(&mut m);
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
    }
}

mod frame_variables {
    use super::*;

    /// The closure is stored once to a frame variable; calls through its
    /// loads are found and bound.
    #[test]
    fn test_store_once_variable_flow() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        m.func_mut(f).parent_scope_param_users = 1;
        let v = m.add_variable("v");

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::StoreFrame {
                scope,
                value: Operand::Inst(c),
                var: v,
            },
        );
        let load = m.add_inst(outer, InstKind::LoadFrame { scope, var: v });
        let call = m.add_inst(outer, new_call(load));

        run_function_analysis(&mut m);

        assert_eq!(call_target(&m, call), Some(f));
        // Store scope matched the tracked scope, so the environment is
        // the scope at the load point.
        assert_eq!(call_environment(&m, call), Some(scope));
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
    }

    /// A variable with two stores is opaque to the analysis.
    #[test]
    fn test_multi_store_variable_gives_up() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let v = m.add_variable("v");

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::StoreFrame {
                scope,
                value: Operand::Inst(c),
                var: v,
            },
        );
        m.add_inst(
            outer,
            InstKind::StoreFrame {
                scope,
                value: Operand::Undefined,
                var: v,
            },
        );
        let load = m.add_inst(outer, InstKind::LoadFrame { scope, var: v });
        let call = m.add_inst(outer, new_call(load));

        run_function_analysis(&mut m);

        assert!(!m.func(f).attributes.all_callsites_known_in_strict_mode);
        assert_eq!(call_target(&m, call), None);
    }

    /// Storing into a different scope still binds the target but cannot
    /// propagate the environment.
    #[test]
    fn test_mismatched_store_scope_drops_environment() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        m.func_mut(f).parent_scope_param_users = 1;
        let v = m.add_variable("v");

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let other = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        m.add_inst(
            outer,
            InstKind::StoreFrame {
                scope: other,
                value: Operand::Inst(c),
                var: v,
            },
        );
        let load = m.add_inst(outer, InstKind::LoadFrame { scope: other, var: v });
        let call = m.add_inst(outer, new_call(load));

        run_function_analysis(&mut m);

        assert_eq!(call_target(&m, call), Some(f));
        assert_eq!(call_environment(&m, call), None);
    }
}

mod scope_projection {
    use super::*;

    /// GetClosureScope is forwarded to the known scope; the projection
    /// itself is left for DCE.
    #[test]
    fn test_get_closure_scope_forwarded() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let c = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let projected = m.add_inst(outer, InstKind::GetClosureScope { closure: c });
        let user = m.add_inst(
            outer,
            InstKind::Other {
                operands: vec![Operand::Inst(projected)],
            },
        );
        m.add_inst(outer, new_call(c));

        run_function_analysis(&mut m);

        assert!(m.inst(projected).users.is_empty());
        match &m.inst(user).kind {
            InstKind::Other { operands } => assert_eq!(operands[0], Operand::Inst(scope)),
            _ => unreachable!(),
        }
        // Projecting the scope does not leak the closure.
        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
    }
}

mod unreachable {
    use super::*;

    /// c = CreateClosure(f) with no other users: f has no callsites.
    #[test]
    fn test_uncalled_function_is_unreachable() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        m.add_inst(outer, InstKind::CreateClosure { function: f, scope });

        run_function_analysis(&mut m);

        assert!(m.func(f).attributes.all_callsites_known_in_strict_mode);
        assert!(m.func(f).attributes.unreachable);
    }

    /// An escaping function is never marked unreachable.
    #[test]
    fn test_escaping_function_not_unreachable() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let g = m.add_function("g", false);

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let cf = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let cg = m.add_inst(outer, InstKind::CreateClosure { function: g, scope });
        m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(cg),
                target: None,
                environment: None,
                args: vec![Operand::Inst(cf)],
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);

        assert!(!m.func(f).attributes.unreachable);
    }
}

mod laws {
    use super::*;

    /// Running the pass twice flips no attributes and rebinds nothing.
    #[test]
    fn test_pass_is_idempotent() {
        let mut m = Module::new();
        let outer = m.add_function("outer", true);
        let f = m.add_function("f", false);
        let g = m.add_function("g", false);
        m.func_mut(f).parent_scope_param_users = 1;
        let v = m.add_variable("v");

        let scope = m.add_inst(outer, InstKind::CreateScope { parent: None });
        let cf = m.add_inst(outer, InstKind::CreateClosure { function: f, scope });
        let cg = m.add_inst(outer, InstKind::CreateClosure { function: g, scope });
        m.add_inst(
            outer,
            InstKind::StoreFrame {
                scope,
                value: Operand::Inst(cf),
                var: v,
            },
        );
        let load = m.add_inst(outer, InstKind::LoadFrame { scope, var: v });
        let call1 = m.add_inst(outer, new_call(load));
        let call2 = m.add_inst(
            outer,
            InstKind::Call {
                callee: Operand::Inst(cg),
                target: None,
                environment: None,
                args: vec![Operand::Inst(cf)],
                new_target: Operand::Undefined,
            },
        );

        run_function_analysis(&mut m);
        let snapshot = |m: &Module| {
            (
                m.func(f).attributes.all_callsites_known_in_strict_mode,
                m.func(f).attributes.unreachable,
                m.func(g).attributes.all_callsites_known_in_strict_mode,
                call_target(m, call1),
                call_environment(m, call1),
                call_target(m, call2),
            )
        };
        let first = snapshot(&m);
        run_function_analysis(&mut m);
        assert_eq!(first, snapshot(&m));
    }
}
