/// Generates a module handing out process-unique ids.
///
/// Ids are recycled once `remove` has been called for them, the counter
/// itself only ever moves forward.
macro_rules! id_gen {
    ($mod_name:ident) => {
        pub(crate) mod $mod_name {
            use once_cell::sync::Lazy;
            use std::{collections::HashSet, sync::Mutex};

            struct IdPool {
                in_use: HashSet<usize>,
                next: usize,
            }

            static POOL: Lazy<Mutex<IdPool>> = Lazy::new(|| {
                Mutex::new(IdPool {
                    in_use: HashSet::new(),
                    next: 0,
                })
            });

            pub(crate) fn next() -> usize {
                let mut pool = POOL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

                if pool.in_use.len() == usize::MAX {
                    panic!("Out of ids");
                }

                loop {
                    let candidate = pool.next;
                    pool.next = pool.next.wrapping_add(1);
                    if pool.in_use.insert(candidate) {
                        return candidate;
                    }
                }
            }

            pub(crate) fn remove(id: usize) -> bool {
                POOL.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .in_use
                    .remove(&id)
            }
        }
    };
}

pub(crate) use id_gen;
