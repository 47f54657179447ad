// This file is part of flint-db.
//
// flint-db is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// flint-db is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Ordered set (OS): a skip list of `(score, member)` pairs ordered by score
//! then member, paired with a hash map from member to score. The two
//! structures must agree on every member's score at all times (spec
//! property 7); all mutations go through `ZSet` so that invariant can never
//! be observed broken from outside this module.

use rand::Rng;
use std::collections::HashMap;

const MAX_LEVEL: usize = 32;
const NIL: usize = usize::MAX;

struct Node {
	score: f64,
	member: Vec<u8>,
	forward: Vec<usize>,
}

pub struct ZSet {
	nodes: Vec<Node>,
	free: Vec<usize>,
	head: Vec<usize>,
	level: usize,
	len: usize,
	scores: HashMap<Vec<u8>, f64>,
}

fn key_order(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> std::cmp::Ordering {
	a_score.partial_cmp(&b_score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a_member.cmp(b_member))
}

impl ZSet {
	pub fn new() -> ZSet {
		ZSet {
			nodes: Vec::new(),
			free: Vec::new(),
			head: vec![NIL; MAX_LEVEL],
			level: 1,
			len: 0,
			scores: HashMap::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn score(&self, member: &[u8]) -> Option<f64> {
		self.scores.get(member).copied()
	}

	fn random_level() -> usize {
		let mut lvl = 1;
		let mut rng = rand::thread_rng();
		while lvl < MAX_LEVEL && rng.gen_bool(0.25) {
			lvl += 1;
		}
		lvl
	}

	fn links_at(&self, node_idx: usize, lvl: usize) -> usize {
		if node_idx == NIL { self.head[lvl] } else { self.nodes[node_idx].forward[lvl] }
	}

	fn set_link_at(&mut self, node_idx: usize, lvl: usize, target: usize) {
		if node_idx == NIL {
			self.head[lvl] = target;
		} else {
			self.nodes[node_idx].forward[lvl] = target;
		}
	}

	pub fn insert(&mut self, member: Vec<u8>, score: f64) {
		if let Some(&old_score) = self.scores.get(&member) {
			if old_score == score {
				return;
			}
			self.remove(&member);
		}
		let update = self.find_predecessors_idx(score, &member);
		let lvl = Self::random_level();
		if lvl > self.level {
			self.level = lvl;
		}
		let node = Node { score, member: member.clone(), forward: vec![NIL; lvl] };
		let idx = match self.free.pop() {
			Some(i) => {
				self.nodes[i] = node;
				i
			}
			None => {
				self.nodes.push(node);
				self.nodes.len() - 1
			}
		};
		for level in 0..lvl {
			let pred = update[level];
			let next = self.links_at(pred, level);
			self.set_link_at(pred, level, idx);
			self.nodes[idx].forward[level] = next;
		}
		self.scores.insert(member, score);
		self.len += 1;
	}

	fn find_predecessors_idx(&self, score: f64, member: &[u8]) -> [usize; MAX_LEVEL] {
		let mut update = [NIL; MAX_LEVEL];
		let mut cur = NIL;
		for lvl in (0..self.level).rev() {
			loop {
				let next = self.links_at(cur, lvl);
				if next == NIL {
					break;
				}
				let n = &self.nodes[next];
				if key_order(n.score, &n.member, score, member) == std::cmp::Ordering::Less {
					cur = next;
				} else {
					break;
				}
			}
			update[lvl] = cur;
		}
		update
	}

	pub fn remove(&mut self, member: &[u8]) -> bool {
		let score = match self.scores.remove(member) {
			Some(s) => s,
			None => return false,
		};
		let update = self.find_predecessors_idx(score, member);
		let target = self.links_at(update[0], 0);
		if target == NIL || self.nodes[target].member != member {
			// Shouldn't happen if scores map and skip list agree.
			self.scores.insert(member.to_vec(), score);
			return false;
		}
		let lvl = self.nodes[target].forward.len();
		for level in 0..lvl {
			let pred = update[level];
			if self.links_at(pred, level) == target {
				let next = self.nodes[target].forward[level];
				self.set_link_at(pred, level, next);
			}
		}
		self.free.push(target);
		self.len -= 1;
		true
	}

	pub fn iter_ascending(&self) -> impl Iterator<Item = (&[u8], f64)> {
		let mut cur = self.head[0];
		std::iter::from_fn(move || {
			if cur == NIL {
				return None;
			}
			let n = &self.nodes[cur];
			cur = n.forward[0];
			Some((n.member.as_slice(), n.score))
		})
	}

	pub fn range_by_rank(&self, start: usize, stop_inclusive: usize) -> Vec<(Vec<u8>, f64)> {
		self.iter_ascending()
			.enumerate()
			.filter(|(i, _)| *i >= start && *i <= stop_inclusive)
			.map(|(_, (m, s))| (m.to_vec(), s))
			.collect()
	}

	/// Spec property 7: for every member the skip list score equals the hash
	/// map score.
	pub fn check_consistency(&self) -> bool {
		if self.iter_ascending().count() != self.scores.len() {
			return false;
		}
		let mut prev: Option<(f64, Vec<u8>)> = None;
		for (member, score) in self.iter_ascending() {
			match self.scores.get(member) {
				Some(&s) if s == score => {}
				_ => return false,
			}
			if let Some((ps, pm)) = &prev {
				if key_order(*ps, pm, score, member) == std::cmp::Ordering::Greater {
					return false;
				}
			}
			prev = Some((score, member.to_vec()));
		}
		true
	}
}

impl Default for ZSet {
	fn default() -> ZSet {
		ZSet::new()
	}
}

#[cfg(test)]
mod test {
	use super::ZSet;

	#[test]
	fn insert_and_ordering() {
		let mut z = ZSet::new();
		z.insert(b"a".to_vec(), 3.0);
		z.insert(b"b".to_vec(), 1.0);
		z.insert(b"c".to_vec(), 2.0);
		let order: Vec<_> = z.iter_ascending().map(|(m, s)| (m.to_vec(), s)).collect();
		assert_eq!(order, vec![(b"b".to_vec(), 1.0), (b"c".to_vec(), 2.0), (b"a".to_vec(), 3.0)]);
		assert!(z.check_consistency());
	}

	#[test]
	fn update_score_moves_member() {
		let mut z = ZSet::new();
		z.insert(b"a".to_vec(), 1.0);
		z.insert(b"b".to_vec(), 2.0);
		z.insert(b"a".to_vec(), 5.0);
		assert_eq!(z.score(b"a"), Some(5.0));
		let order: Vec<_> = z.iter_ascending().map(|(m, _)| m.to_vec()).collect();
		assert_eq!(order, vec![b"b".to_vec(), b"a".to_vec()]);
		assert!(z.check_consistency());
	}

	#[test]
	fn remove_member() {
		let mut z = ZSet::new();
		z.insert(b"a".to_vec(), 1.0);
		z.insert(b"b".to_vec(), 2.0);
		assert!(z.remove(b"a"));
		assert_eq!(z.len(), 1);
		assert_eq!(z.score(b"a"), None);
		assert!(z.check_consistency());
	}

	#[test]
	fn large_population_stays_consistent() {
		let mut z = ZSet::new();
		for i in 0..500 {
			z.insert(format!("m{}", i).into_bytes(), (i % 50) as f64);
		}
		assert_eq!(z.len(), 500);
		assert!(z.check_consistency());
		for i in (0..500).step_by(3) {
			z.remove(format!("m{}", i).into_bytes().as_slice());
		}
		assert!(z.check_consistency());
	}
}
