//! End-to-end graph construction tests: small hand-assembled methods go
//! through block discovery, simulation, and graph building, and the
//! resulting node structure is checked.

use bc2ir::bytecode::opcodes::*;
use bc2ir::frontend::{build_graph, BuildConfig, BuildError};
use bc2ir::graph::{Graph, GraphCache, NodeKind};
use bc2ir::pool::{
    ConstantPool, ExceptionHandler, Method, MethodAccessFlags, MethodData, MethodSig, PoolArenas,
    PoolEntry, TypeData,
};
use bc2ir::Kind;

fn method_with<'g>(
    pool: &'g ConstantPool<'g>,
    params: Vec<Kind>,
    return_kind: Kind,
    flags: MethodAccessFlags,
    code: Vec<u8>,
) -> Method<'g> {
    let object = pool.add_type(TypeData::new("java/lang/Object", None));
    let holder = pool.add_type(TypeData::new("Test", Some(object)));
    let declaration = pool.add_method(MethodData::new(
        holder,
        "test",
        MethodSig::new(params, return_kind),
        flags,
    ));
    Method::new(declaration, code, 8, 8)
}

fn count_kind(graph: &Graph, predicate: impl Fn(&NodeKind) -> bool) -> usize {
    graph.iter().filter(|&id| predicate(graph.kind(id))).count()
}

/// x = 0; while (cond) { if (a) x += 1; else if (b) x -= 1; } return x;
///
/// Expect exactly one loop header, two joins inside the body (the
/// else-if reconvergence and the merged back edge), and a live phi for x.
#[test]
fn loop_with_nested_ifs() {
    let code = vec![
        ICONST_0,            //  0
        ISTORE_3,            //  1
        ILOAD_0,             //  2: loop header
        IFEQ, 0, 23,         //  3: -> 26
        ILOAD_1,             //  6
        IFEQ, 0, 9,          //  7: -> 16
        IINC, 3, 1,          // 10
        GOTO, 0xff, 0xf5,    // 13: -> 2
        ILOAD_2,             // 16
        IFEQ, 0, 6,          // 17: -> 23
        IINC, 3, 0xff,       // 20
        GOTO, 0xff, 0xeb,    // 23: -> 2
        ILOAD_3,             // 26
        IRETURN,             // 27
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Int, Kind::Int, Kind::Int],
        Kind::Int,
        MethodAccessFlags::STATIC,
        code,
    );

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();

    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::LoopBegin { .. })), 1);
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::LoopEnd { .. })), 1);
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Merge { .. })), 2);
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Return { .. })), 1);

    // after redundant-phi elimination only x (and merge-level phis of x)
    // select between values
    let loop_begin = graph
        .iter()
        .find(|&id| matches!(graph.kind(id), NodeKind::LoopBegin { .. }))
        .unwrap();
    let loop_phis = graph.phis_of(loop_begin);
    assert_eq!(loop_phis.len(), 1, "only x varies around the loop");
    assert_eq!(graph.result_kind(loop_phis[0]), Kind::Int);
}

/// A trapping array store inside a catch-all try region: the dispatch
/// state carries exactly the exception, and the handler is reached
/// unconditionally.
#[test]
fn array_store_under_catch_all() {
    let code = vec![
        ALOAD_0,    // 0
        ILOAD_1,    // 1
        ILOAD_2,    // 2
        IASTORE,    // 3: trapping, covered
        GOTO, 0, 4, // 4: -> 8
        ASTORE_3,   // 7: handler entry
        RETURN,     // 8
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(
        &pool,
        vec![Kind::Object, Kind::Int, Kind::Int],
        Kind::Void,
        MethodAccessFlags::STATIC,
        code,
    );
    method.exception_handlers.push(ExceptionHandler {
        start_bci: 0,
        end_bci: 4,
        handler_bci: 7,
        catch_type: None,
    });

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();

    // explicit null and bounds checks route synthesized exceptions into
    // the dispatch path
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::CreateException { .. })),
        2
    );
    // every dispatch-entry state holds exactly the in-flight exception
    let dispatch_states: Vec<_> = graph
        .iter()
        .filter_map(|id| match graph.kind(id) {
            NodeKind::FrameState(data) if data.rethrow_exception => Some(data),
            _ => None,
        })
        .collect();
    assert!(!dispatch_states.is_empty());
    for state in dispatch_states {
        assert_eq!(state.stack.len(), 1);
        assert_eq!(state.stack[0].unwrap().kind, Kind::Object);
    }
    // no handler matched means unwinding, but the catch-all always matches
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Unwind { .. })), 0);
}

/// Merging paths that disagree on stack height must bail out, never
/// silently truncate.
#[test]
fn stack_height_mismatch_is_a_verification_bailout() {
    let code = vec![
        ILOAD_0,    // 0
        IFEQ, 0, 6, // 1: -> 7 with empty stack
        ICONST_1,   // 4
        GOTO, 0, 2, // 5: -> 7 with one value
        RETURN,     // 7
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Int],
        Kind::Void,
        MethodAccessFlags::STATIC,
        code,
    );

    assert!(matches!(
        build_graph(&method, &BuildConfig::default(), None),
        Err(BuildError::FrameStateMismatch(_))
    ));
}

/// An uncovered trapping access routes its explicit check failures out
/// through the unwind path.
#[test]
fn uncovered_trap_unwinds() {
    let code = vec![
        ALOAD_0, // 0
        ILOAD_1, // 1
        ILOAD_2, // 2
        IASTORE, // 3: trapping, not covered
        RETURN,  // 4
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Object, Kind::Int, Kind::Int],
        Kind::Void,
        MethodAccessFlags::STATIC,
        code,
    );

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Unwind { .. })), 1);
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::CreateException { .. })),
        2
    );

    // with explicit checks disabled trapping stays implicit
    let mut config = BuildConfig::default();
    config.explicit_exception_checks = false;
    let graph = build_graph(&method, &config, None).unwrap();
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Unwind { .. })), 0);
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::CreateException { .. })),
        0
    );
}

/// Two subroutine call sites each get their own specialized copy of the
/// shared body, and both return-address continuations are stitched in.
#[test]
fn subroutine_calls_specialize_the_body() {
    let code = vec![
        JSR, 0, 8, // 0: -> 8
        JSR, 0, 5, // 3: -> 8
        RETURN,    // 6
        NOP,       // 7
        ASTORE_3,  // 8: subroutine body
        RET, 3,    // 9
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![],
        Kind::Void,
        MethodAccessFlags::STATIC,
        code,
    );

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();

    // each specialized return checks its recorded return address
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::FixedGuard { .. })), 2);
    let ret_addr_constants = count_kind(&graph, |k| {
        matches!(
            k,
            NodeKind::Constant {
                value: bc2ir::graph::ConstValue::RetAddr(_)
            }
        )
    });
    assert_eq!(ret_addr_constants, 2);
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Return { .. })), 1);
}

/// A branch arm the profile says is never taken parses to a deoptimize
/// node instead of real code.
#[test]
fn never_taken_branch_parses_to_deopt() {
    let code = vec![
        ILOAD_0,    // 0
        IFEQ, 0, 5, // 1: -> 6
        ICONST_0,   // 4
        IRETURN,    // 5
        ICONST_1,   // 6
        IRETURN,    // 7
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(
        &pool,
        vec![Kind::Int],
        Kind::Int,
        MethodAccessFlags::STATIC,
        code,
    );
    method.profile.record_branch_taken(1, 0.0);

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert!(graph.has_deopt());
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Return { .. })), 1);
}

/// Unresolved entities degrade to deoptimizing stubs unless eager
/// resolving forces them.
#[test]
fn unresolved_allocation_deopts_unless_eager() {
    let code = vec![
        NEW, 0, 0, // 0
        POP,       // 3
        RETURN,    // 4
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(&pool, vec![], Kind::Void, MethodAccessFlags::STATIC, code);
    let lazy = pool.add_type(TypeData::unresolved("Lazy"));
    method.constants.push(PoolEntry::Type(lazy));

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert!(graph.has_deopt());
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::NewInstance { .. })),
        0
    );

    let mut config = BuildConfig::default();
    config.eager_resolving = true;
    let graph = build_graph(&method, &config, None).unwrap();
    assert!(!graph.has_deopt());
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::NewInstance { .. })),
        1
    );
}

/// Synchronized methods take the monitor before the first block and
/// release it on the return path.
#[test]
fn synchronized_method_brackets_the_body() {
    let code = vec![ILOAD_1, IRETURN];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Int],
        Kind::Int,
        MethodAccessFlags::SYNCHRONIZED,
        code,
    );

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::MonitorEnter { .. })),
        1
    );
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::MonitorExit { .. })),
        1
    );
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Return { .. })), 1);
}

/// Calls split into a normal and an exceptional continuation when the
/// call site is covered by a handler.
#[test]
fn covered_call_splits_into_two_continuations() {
    let code = vec![
        INVOKESTATIC, 0, 0, // 0: covered
        RETURN,             // 3
        ASTORE_0,           // 4: handler entry
        RETURN,             // 5
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(&pool, vec![], Kind::Void, MethodAccessFlags::STATIC, code);
    let holder = method.declaration.holder;
    let callee = pool.add_method(MethodData::new(
        holder,
        "callee",
        MethodSig::new(vec![], Kind::Void),
        MethodAccessFlags::STATIC,
    ));
    method.constants.push(PoolEntry::Method(callee));
    method.exception_handlers.push(ExceptionHandler {
        start_bci: 0,
        end_bci: 3,
        handler_bci: 4,
        catch_type: None,
    });

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::InvokeWithException { .. })),
        1
    );
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::ExceptionObject)),
        1
    );
    // both the normal path and the handler path return
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Merge { .. })), 1);
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Return { .. })), 1);
}

/// An uncovered call stays a plain invoke with the trap left implicit.
#[test]
fn uncovered_call_stays_plain() {
    let code = vec![
        ICONST_2,           // 0
        INVOKESTATIC, 0, 0, // 1
        POP,                // 4
        RETURN,             // 5
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(&pool, vec![], Kind::Void, MethodAccessFlags::STATIC, code);
    let holder = method.declaration.holder;
    let callee = pool.add_method(MethodData::new(
        holder,
        "callee",
        MethodSig::new(vec![Kind::Int], Kind::Int),
        MethodAccessFlags::STATIC,
    ));
    method.constants.push(PoolEntry::Method(callee));

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Invoke { .. })), 1);
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::InvokeWithException { .. })),
        0
    );
}

/// The caller-owned cache returns the same graph for a second
/// compilation and refuses graphs that contain deopt nodes.
#[test]
fn graph_cache_round_trip() {
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Int],
        Kind::Int,
        MethodAccessFlags::STATIC,
        vec![ILOAD_0, IRETURN],
    );
    let mut config = BuildConfig::default();
    config.cache_graphs = true;
    let mut cache = GraphCache::new();

    let first = build_graph(&method, &config, Some(&mut cache)).unwrap();
    assert_eq!(cache.len(), 1);
    let second = build_graph(&method, &config, Some(&mut cache)).unwrap();
    assert!(std::rc::Rc::ptr_eq(&first, &second));

    // a deopting graph is not cached
    let mut unresolved_method =
        method_with(&pool, vec![], Kind::Void, MethodAccessFlags::STATIC, vec![NEW, 0, 0, POP, RETURN]);
    let lazy = pool.add_type(TypeData::unresolved("Lazy2"));
    unresolved_method.constants.push(PoolEntry::Type(lazy));
    let holder = unresolved_method.declaration.holder;
    let other = pool.add_method(MethodData::new(
        holder,
        "other",
        MethodSig::new(vec![], Kind::Void),
        MethodAccessFlags::STATIC,
    ));
    unresolved_method.declaration = other;
    let _ = build_graph(&unresolved_method, &config, Some(&mut cache)).unwrap();
    assert_eq!(cache.len(), 1);
}

/// A typed handler compiles to an instance-of test between the handler
/// and the surrounding dispatch (here: the unwind path).
#[test]
fn typed_handler_tests_the_exception() {
    let code = vec![
        ALOAD_0,    // 0
        ILOAD_1,    // 1
        ILOAD_2,    // 2
        IASTORE,    // 3: trapping, covered
        GOTO, 0, 4, // 4: -> 8
        ASTORE_3,   // 7: handler entry
        RETURN,     // 8
    ];
    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let mut method = method_with(
        &pool,
        vec![Kind::Object, Kind::Int, Kind::Int],
        Kind::Void,
        MethodAccessFlags::STATIC,
        code,
    );
    let object = pool.lookup_type("java/lang/Object").unwrap();
    let oob = pool.add_type(TypeData::new("java/lang/IndexOutOfBoundsException", Some(object)));
    method.exception_handlers.push(ExceptionHandler {
        start_bci: 0,
        end_bci: 4,
        handler_bci: 7,
        catch_type: Some(oob),
    });

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    assert_eq!(
        count_kind(&graph, |k| matches!(k, NodeKind::InstanceOf { .. })),
        1
    );
    // the non-matching path unwinds out of the method
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Unwind { .. })), 1);
}

/// Both switch forms parse their distinct targets and merge arms that
/// share a target.
#[test]
fn tableswitch_arms_merge_on_shared_targets() {
    let mut code = vec![
        ILOAD_0,     // 0
        TABLESWITCH, // 1
        0, 0,        // padding to 4
    ];
    code.extend_from_slice(&25i32.to_be_bytes()); // default -> 26
    code.extend_from_slice(&0i32.to_be_bytes()); // low
    code.extend_from_slice(&1i32.to_be_bytes()); // high
    code.extend_from_slice(&23i32.to_be_bytes()); // case 0 -> 24
    code.extend_from_slice(&25i32.to_be_bytes()); // case 1 -> 26
    code.push(ICONST_0); // 24
    code.push(IRETURN); // 25
    code.push(ICONST_1); // 26
    code.push(IRETURN); // 27

    let arenas = PoolArenas::new();
    let pool = ConstantPool::new(&arenas);
    let method = method_with(
        &pool,
        vec![Kind::Int],
        Kind::Int,
        MethodAccessFlags::STATIC,
        code,
    );

    let graph = build_graph(&method, &BuildConfig::default(), None).unwrap();
    let switch = graph
        .iter()
        .find(|&id| matches!(graph.kind(id), NodeKind::TableSwitch { .. }))
        .expect("switch node");
    match graph.kind(switch) {
        NodeKind::TableSwitch { successors, .. } => assert_eq!(successors.len(), 3),
        _ => unreachable!(),
    }
    // case 1 and default share a target (one merge); both returns meet
    // at the shared return block (the other)
    assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Merge { .. })), 2);
}
