//! Ordered read/write/invoke interceptor chains (§4.C).
//!
//! Three partitions (`RunsFirst`, `Middle`, `RunsLast`) are ordered
//! independently and concatenated; within a partition, `runs_before`/
//! `runs_after` edges are honoured via Kahn's algorithm, ties broken by
//! registration order. A cycle, or an edge that crosses partitions, fails
//! at build time naming the cycle -- never at dispatch time.

use std::collections::VecDeque;
use std::sync::Arc;
use tessera_core::CoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterceptorPartition {
    RunsFirst,
    Middle,
    RunsLast,
}

/// What an interceptor declares about itself; built once per registered
/// interceptor instance and fed into `order`.
#[derive(Clone, Debug)]
pub struct InterceptorDescriptor {
    pub name: &'static str,
    pub partition: InterceptorPartition,
    pub runs_before: Vec<&'static str>,
    pub runs_after: Vec<&'static str>,
}

impl InterceptorDescriptor {
    pub fn new(name: &'static str, partition: InterceptorPartition) -> Self {
        Self {
            name,
            partition,
            runs_before: Vec::new(),
            runs_after: Vec::new(),
        }
    }

    pub fn runs_before(mut self, name: &'static str) -> Self {
        self.runs_before.push(name);
        self
    }

    pub fn runs_after(mut self, name: &'static str) -> Self {
        self.runs_after.push(name);
        self
    }
}

/// Orders descriptor indices into dispatch order: all `RunsFirst` members
/// (topologically sorted among themselves), then `Middle`, then
/// `RunsLast`. An edge naming a member of a different partition is
/// ignored for ordering purposes (cross-partition ordering is undefined
/// by construction -- partitions are the coarse order).
pub fn order(descriptors: &[InterceptorDescriptor]) -> Result<Vec<usize>, CoreError> {
    let mut result = Vec::with_capacity(descriptors.len());
    for partition in [
        InterceptorPartition::RunsFirst,
        InterceptorPartition::Middle,
        InterceptorPartition::RunsLast,
    ] {
        let members: Vec<usize> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| d.partition == partition)
            .map(|(i, _)| i)
            .collect();
        result.extend(order_partition(descriptors, &members)?);
    }
    Ok(result)
}

fn order_partition(
    descriptors: &[InterceptorDescriptor],
    members: &[usize],
) -> Result<Vec<usize>, CoreError> {
    let name_to_local: std::collections::HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(local, &idx)| (descriptors[idx].name, local))
        .collect();

    // edge local_a -> local_b means a must run before b.
    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
    let mut in_degree: Vec<usize> = vec![0; members.len()];

    for (local, &idx) in members.iter().enumerate() {
        for before in &descriptors[idx].runs_before {
            if let Some(&target) = name_to_local.get(before) {
                out_edges[local].push(target);
                in_degree[target] += 1;
            }
        }
        for after in &descriptors[idx].runs_after {
            if let Some(&source) = name_to_local.get(after) {
                out_edges[source].push(local);
                in_degree[local] += 1;
            }
        }
    }

    // Stable Kahn's: ready queue always picks the smallest registration
    // (local) index among zero-in-degree nodes, so ties break by
    // registration order.
    let mut ready: VecDeque<usize> = (0..members.len())
        .filter(|&local| in_degree[local] == 0)
        .collect();
    let mut ordered_locals = Vec::with_capacity(members.len());

    while !ready.is_empty() {
        let (pos, &smallest) = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &local)| local)
            .expect("ready queue checked non-empty above");
        ready.remove(pos);
        ordered_locals.push(smallest);
        for &next in &out_edges[smallest] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if ordered_locals.len() != members.len() {
        let remaining: Vec<String> = (0..members.len())
            .filter(|&local| in_degree[local] > 0)
            .map(|local| descriptors[members[local]].name.to_string())
            .collect();
        return Err(CoreError::InterceptorCycle { members: remaining });
    }

    Ok(ordered_locals.into_iter().map(|local| members[local]).collect())
}

/// A synchronous read interceptor. `next` resolves the rest of the chain
/// (and ultimately the backing storage); an interceptor may inspect or
/// replace the context's value, call `next`, or short-circuit.
pub trait ReadInterceptor<Ctx>: Send + Sync {
    fn descriptor(&self) -> InterceptorDescriptor;
    fn intercept(&self, ctx: &mut Ctx, next: &dyn Fn(&mut Ctx));
}

/// An immutable, memoized dispatch order for one chain kind. Invalidated
/// (rebuilt) whenever the owning context's service set or fallback graph
/// changes; see `SubjectContext::invalidate_chain_cache`.
pub struct Chain<Ctx> {
    ordered: Vec<Arc<dyn ReadInterceptor<Ctx>>>,
}

impl<Ctx> Chain<Ctx> {
    pub fn build(interceptors: Vec<Arc<dyn ReadInterceptor<Ctx>>>) -> Result<Self, CoreError> {
        let descriptors: Vec<_> = interceptors.iter().map(|i| i.descriptor()).collect();
        let ordering = order(&descriptors)?;
        let ordered = ordering.into_iter().map(|i| interceptors[i].clone()).collect();
        Ok(Self { ordered })
    }

    /// Dispatch from the outside in: the first-registered (outermost)
    /// handler runs first and decides whether to call `next`.
    pub fn dispatch(&self, ctx: &mut Ctx, terminal: &dyn Fn(&mut Ctx)) {
        Self::go(&self.ordered, ctx, terminal)
    }

    fn go(chain: &[Arc<dyn ReadInterceptor<Ctx>>], ctx: &mut Ctx, terminal: &dyn Fn(&mut Ctx)) {
        match chain.split_first() {
            None => terminal(ctx),
            Some((head, rest)) => head.intercept(ctx, &|ctx| Self::go(rest, ctx, terminal)),
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &'static str, partition: InterceptorPartition) -> InterceptorDescriptor {
        InterceptorDescriptor::new(name, partition)
    }

    #[test]
    fn partitions_are_concatenated_first_middle_last() {
        let descriptors = vec![
            named("m1", InterceptorPartition::Middle),
            named("last1", InterceptorPartition::RunsLast),
            named("first1", InterceptorPartition::RunsFirst),
        ];
        let ordered = order(&descriptors).unwrap();
        let names: Vec<_> = ordered.iter().map(|&i| descriptors[i].name).collect();
        assert_eq!(names, vec!["first1", "m1", "last1"]);
    }

    #[test]
    fn runs_before_is_honoured_within_a_partition() {
        let descriptors = vec![
            named("a", InterceptorPartition::Middle).runs_before("b"),
            named("b", InterceptorPartition::Middle),
        ];
        let ordered = order(&descriptors).unwrap();
        let names: Vec<_> = ordered.iter().map(|&i| descriptors[i].name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let descriptors = vec![
            named("a", InterceptorPartition::Middle),
            named("b", InterceptorPartition::Middle),
            named("c", InterceptorPartition::Middle),
        ];
        let ordered = order(&descriptors).unwrap();
        let names: Vec<_> = ordered.iter().map(|&i| descriptors[i].name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_fails_with_a_diagnostic_naming_the_members() {
        // Scenario 6: A(runs-before=B), B(runs-before=A).
        let descriptors = vec![
            named("A", InterceptorPartition::Middle).runs_before("B"),
            named("B", InterceptorPartition::Middle).runs_before("A"),
        ];
        let err = order(&descriptors).unwrap_err();
        match err {
            CoreError::InterceptorCycle { mut members } => {
                members.sort();
                assert_eq!(members, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected InterceptorCycle, got {other:?}"),
        }
    }

    #[test]
    fn first_registered_handler_runs_outermost() {
        struct Recording {
            name: &'static str,
            log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        }
        impl ReadInterceptor<Vec<&'static str>> for Recording {
            fn descriptor(&self) -> InterceptorDescriptor {
                InterceptorDescriptor::new(self.name, InterceptorPartition::Middle)
            }
            fn intercept(&self, ctx: &mut Vec<&'static str>, next: &dyn Fn(&mut Vec<&'static str>)) {
                self.log.lock().push(self.name);
                next(ctx);
            }
        }

        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let outer: Arc<dyn ReadInterceptor<Vec<&'static str>>> = Arc::new(Recording {
            name: "outer",
            log: log.clone(),
        });
        let inner: Arc<dyn ReadInterceptor<Vec<&'static str>>> = Arc::new(Recording {
            name: "inner",
            log: log.clone(),
        });
        let chain = Chain::build(vec![outer, inner]).unwrap();
        let mut ctx = Vec::new();
        chain.dispatch(&mut ctx, &|_| {});
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }
}
