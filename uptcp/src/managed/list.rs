/// Identifies one list within a [`Chains`] set.
///
/// [`Chains`]: struct.Chains.html
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chain(pub usize);

/// A set of doubly linked lists over a shared index space.
///
/// Each member index can be linked into at most one chain of the set at any time. Which chain
/// that is can be queried in constant time, so membership is a property of the structure and not
/// a flag kept next to it. Putting a member into a second chain without removing it first is a
/// programming error and panics.
///
/// The links are kept out of the records they order. A record is addressed only by its index, for
/// example the raw index of a slotmap key.
#[derive(Debug)]
pub struct Chains {
    links: Vec<Link>,
    ends: Vec<Ends>,
}

#[derive(Clone, Copy, Debug)]
struct Link {
    prev: usize,
    next: usize,
    chain: Option<Chain>,
}

#[derive(Clone, Copy, Debug)]
struct Ends {
    first: usize,
    last: usize,
    len: usize,
}

/// Iterator over the members of one chain, front to back.
pub struct Iter<'a> {
    chains: &'a Chains,
    cur: usize,
}

const NIL: usize = usize::max_value();

impl Chains {
    /// Create `chains` empty lists for members `0..members`.
    pub fn new(members: usize, chains: usize) -> Self {
        Chains {
            links: vec![Link { prev: NIL, next: NIL, chain: None }; members],
            ends: vec![Ends { first: NIL, last: NIL, len: 0 }; chains],
        }
    }

    /// The chain the member is currently linked into.
    pub fn chain_of(&self, member: usize) -> Option<Chain> {
        self.links[member].chain
    }

    pub fn contains(&self, chain: Chain, member: usize) -> bool {
        self.chain_of(member) == Some(chain)
    }

    pub fn len(&self, chain: Chain) -> usize {
        self.ends[chain.0].len
    }

    pub fn is_empty(&self, chain: Chain) -> bool {
        self.len(chain) == 0
    }

    /// Number of chains in the set.
    pub fn chains(&self) -> usize {
        self.ends.len()
    }

    pub fn front(&self, chain: Chain) -> Option<usize> {
        match self.ends[chain.0].first {
            NIL => None,
            first => Some(first),
        }
    }

    pub fn push_back(&mut self, chain: Chain, member: usize) {
        self.assert_unlinked(chain, member);
        let ends = &mut self.ends[chain.0];
        let last = ends.last;
        ends.last = member;
        if last == NIL {
            ends.first = member;
        } else {
            self.links[last].next = member;
        }
        ends.len += 1;
        self.links[member] = Link { prev: last, next: NIL, chain: Some(chain) };
    }

    pub fn push_front(&mut self, chain: Chain, member: usize) {
        self.assert_unlinked(chain, member);
        let ends = &mut self.ends[chain.0];
        let first = ends.first;
        ends.first = member;
        if first == NIL {
            ends.last = member;
        } else {
            self.links[first].prev = member;
        }
        ends.len += 1;
        self.links[member] = Link { prev: NIL, next: first, chain: Some(chain) };
    }

    pub fn pop_front(&mut self, chain: Chain) -> Option<usize> {
        let first = self.front(chain)?;
        self.unlink(first);
        Some(first)
    }

    /// Unlink a member from whatever chain it is in.
    pub fn remove(&mut self, member: usize) -> Option<Chain> {
        let chain = self.chain_of(member)?;
        self.unlink(member);
        Some(chain)
    }

    pub fn iter(&self, chain: Chain) -> Iter<'_> {
        Iter { chains: self, cur: self.ends[chain.0].first }
    }

    fn unlink(&mut self, member: usize) {
        let Link { prev, next, chain } = self.links[member];
        let chain = chain.expect("Unlinking a member that is not linked");
        let ends = &mut self.ends[chain.0];

        if prev == NIL {
            assert_eq!(ends.first, member, "Corrupted chain head");
            ends.first = next;
        } else {
            self.links[prev].next = next;
        }

        if next == NIL {
            assert_eq!(ends.last, member, "Corrupted chain tail");
            ends.last = prev;
        } else {
            self.links[next].prev = prev;
        }

        ends.len -= 1;
        self.links[member] = Link { prev: NIL, next: NIL, chain: None };
    }

    fn assert_unlinked(&self, chain: Chain, member: usize) {
        if let Some(old) = self.links[member].chain {
            panic!("Member {} linked into {:?} while already in {:?}", member, chain, old);
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self.cur {
            NIL => None,
            cur => {
                self.cur = self.chains.links[cur].next;
                Some(cur)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROL: Chain = Chain(0);
    const SEND: Chain = Chain(1);

    #[test]
    fn simple() {
        let mut chains = Chains::new(8, 2);
        chains.push_back(CONTROL, 3);
        chains.push_back(CONTROL, 5);
        chains.push_front(CONTROL, 1);
        chains.push_back(SEND, 2);

        assert_eq!(chains.iter(CONTROL).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(chains.len(CONTROL), 3);
        assert_eq!(chains.chain_of(2), Some(SEND));
        assert!(chains.contains(CONTROL, 5));
        assert!(!chains.contains(SEND, 5));

        assert_eq!(chains.remove(3), Some(CONTROL));
        assert_eq!(chains.remove(3), None);
        assert_eq!(chains.pop_front(CONTROL), Some(1));
        assert_eq!(chains.pop_front(CONTROL), Some(5));
        assert_eq!(chains.pop_front(CONTROL), None);
        assert!(chains.is_empty(CONTROL));
        assert_eq!(chains.len(SEND), 1);
    }

    #[test]
    fn relink_after_remove() {
        let mut chains = Chains::new(2, 2);
        chains.push_back(CONTROL, 0);
        chains.remove(0);
        chains.push_front(SEND, 0);
        assert_eq!(chains.front(SEND), Some(0));
    }

    #[test]
    #[should_panic]
    fn exclusive() {
        let mut chains = Chains::new(2, 2);
        chains.push_back(CONTROL, 0);
        chains.push_back(SEND, 0);
    }
}
