//! Transform Frame (TF) Engine.
//!
//! Maintains a tree of named reference frames and the 3-D rigid-body
//! transforms (translation + quaternion rotation) that relate them.  Given any
//! two frame names the engine composes the chain of transforms between them
//! via BFS, walking edges forwards or backwards (using the rigid inverse) as
//! needed.
//!
//! Edges are either *static* (mounting offsets that never expire) or
//! *stamped* (live updates that must be fresh enough for the requested time).
//!
//! # Example
//!
//! ```rust
//! use rangefuse_perception::transform::{
//!     LookupTime, Quaternion, TfEngine, Transform3D, TransformProvider, Vec3,
//! };
//!
//! let mut tf = TfEngine::new();
//!
//! // The sonar sits 0.2 m ahead of the laser.
//! tf.set_static_transform("laser", "sonar_front",
//!     Transform3D::new(Vec3::new(0.2, 0.0, 0.0), Quaternion::identity()));
//!
//! let t = tf.lookup("laser", "sonar_front", LookupTime::Latest).unwrap();
//! let p = t.transform_point(Vec3::new(1.0, 0.0, 0.0));
//! assert!((p.x - 1.2).abs() < 1e-5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use rangefuse_types::{TransformError, TransformStamped};

/// How far a stamped edge may be from the requested time before the lookup
/// is rejected with [`TransformError::Extrapolation`].
const DEFAULT_TOLERANCE_MS: i64 = 500;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1); see [`Quaternion::normalized`].
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `yaw` radians around +Z.
    pub fn from_yaw(yaw: f32) -> Self {
        let half = yaw * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Scale to unit length.  A zero quaternion becomes the identity.
    pub fn normalized(self) -> Self {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if norm <= f32::EPSILON || !norm.is_finite() {
            return Self::identity();
        }
        Self::new(self.w / norm, self.x / norm, self.y / norm, self.z / norm)
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }
}

impl From<[f32; 4]> for Quaternion {
    fn from([w, x, y, z]: [f32; 4]) -> Self {
        Self::new(w, x, y, z)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// Represents the pose of frame B relative to frame A: to convert a point
/// expressed in frame B into frame A, rotate it by `rotation` then add
/// `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Transform3D {
    /// Create a transform from a translation and rotation.
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Compose two transforms: `self` applied first, then `other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// The rigid inverse: T_A_B becomes T_B_A.
    pub fn inverse(self) -> Self {
        let inv_rotation = self.rotation.conjugate();
        Self::new(inv_rotation.rotate(self.translation).neg(), inv_rotation)
    }

    /// Map a point from the child frame into the parent frame.
    pub fn transform_point(self, p: Vec3) -> Vec3 {
        self.rotation.rotate(p).add(self.translation)
    }
}

impl From<&TransformStamped> for Transform3D {
    fn from(msg: &TransformStamped) -> Self {
        Self::new(
            msg.translation.into(),
            Quaternion::from(msg.rotation).normalized(),
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TransformProvider
// ────────────────────────────────────────────────────────────────────────────

/// Which point in time a lookup should resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTime {
    /// The newest data available on every edge of the chain.
    Latest,
    /// A specific instant; stamped edges must lie within the tolerance.
    At(DateTime<Utc>),
}

/// Anything that can resolve the rigid transform between two frames.
///
/// The returned transform maps points expressed in `source_frame` into
/// `target_frame`.
pub trait TransformProvider: Send + Sync {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: LookupTime,
    ) -> Result<Transform3D, TransformError>;
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Edge {
    transform: Transform3D,
    /// `None` for static edges.
    stamp: Option<DateTime<Utc>>,
}

/// A tree of named reference frames and the [`Transform3D`]s that relate
/// them.
///
/// Each child frame has exactly one parent; setting a transform for a child
/// under a new parent re-parents it.  Lookups may traverse edges in either
/// direction.
#[derive(Debug)]
pub struct TfEngine {
    /// `edges[parent][child] = Edge`
    edges: HashMap<String, HashMap<String, Edge>>,
    /// `parents[child] = parent`
    parents: HashMap<String, String>,
    tolerance: TimeDelta,
}

impl Default for TfEngine {
    fn default() -> Self {
        Self {
            edges: HashMap::new(),
            parents: HashMap::new(),
            tolerance: TimeDelta::milliseconds(DEFAULT_TOLERANCE_MS),
        }
    }
}

impl TfEngine {
    /// Create an empty TF engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how stale a stamped edge may be for [`LookupTime::At`].
    pub fn with_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Register or update a static (never expiring) transform.
    pub fn set_static_transform(&mut self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.insert(parent_frame, child_frame, Edge { transform, stamp: None });
    }

    /// Register or update a stamped transform.
    pub fn set_transform(
        &mut self,
        parent_frame: &str,
        child_frame: &str,
        transform: Transform3D,
        stamp: DateTime<Utc>,
    ) {
        self.insert(parent_frame, child_frame, Edge { transform, stamp: Some(stamp) });
    }

    /// Apply a [`TransformStamped`] message.
    pub fn apply(&mut self, msg: &TransformStamped) {
        self.set_transform(&msg.parent_frame, &msg.child_frame, msg.into(), msg.timestamp);
    }

    /// Whether `frame` appears anywhere in the tree.
    pub fn has_frame(&self, frame: &str) -> bool {
        self.edges.contains_key(frame) || self.parents.contains_key(frame)
    }

    fn insert(&mut self, parent_frame: &str, child_frame: &str, edge: Edge) {
        if let Some(old_parent) = self.parents.get(child_frame)
            && old_parent != parent_frame
            && let Some(children) = self.edges.get_mut(old_parent)
        {
            children.remove(child_frame);
        }
        self.parents
            .insert(child_frame.to_string(), parent_frame.to_string());
        self.edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), edge);
    }

    /// Check a stamped edge against the requested time.
    fn edge_usable(&self, frame: &str, edge: &Edge, time: LookupTime) -> Result<(), TransformError> {
        match (edge.stamp, time) {
            (None, _) | (_, LookupTime::Latest) => Ok(()),
            (Some(stamp), LookupTime::At(requested)) => {
                if (requested - stamp).abs() <= self.tolerance {
                    Ok(())
                } else {
                    Err(TransformError::Extrapolation {
                        frame: frame.to_string(),
                        requested,
                        latest: stamp,
                    })
                }
            }
        }
    }

    /// Neighbours of `frame` together with the transform T_frame_next.
    fn neighbours<'a>(&'a self, frame: &'a str) -> impl Iterator<Item = (&'a str, &'a str, Edge)> + 'a {
        let children = self
            .edges
            .get(frame)
            .into_iter()
            .flat_map(|children| children.iter())
            .map(|(child, edge)| (child.as_str(), child.as_str(), *edge));
        let parent = self.parents.get(frame).and_then(|parent| {
            self.edges
                .get(parent)
                .and_then(|children| children.get(frame))
                .map(|edge| {
                    let inverted = Edge {
                        transform: edge.transform.inverse(),
                        stamp: edge.stamp,
                    };
                    // The edge is owned by `frame` as the child.
                    (parent.as_str(), frame, inverted)
                })
        });
        children.chain(parent)
    }
}

impl TransformProvider for TfEngine {
    /// BFS from `target_frame` to `source_frame`, composing T_target_source.
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: LookupTime,
    ) -> Result<Transform3D, TransformError> {
        if target_frame == source_frame {
            return Ok(Transform3D::identity());
        }
        for frame in [target_frame, source_frame] {
            if !self.has_frame(frame) {
                return Err(TransformError::UnknownFrame(frame.to_string()));
            }
        }

        let mut queue: VecDeque<(&str, Transform3D)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stale: Option<TransformError> = None;

        queue.push_back((target_frame, Transform3D::identity()));
        visited.insert(target_frame);

        while let Some((current, accumulated)) = queue.pop_front() {
            for (next, edge_child, edge) in self.neighbours(current) {
                if visited.contains(next) {
                    continue;
                }
                if let Err(e) = self.edge_usable(edge_child, &edge, time) {
                    stale.get_or_insert(e);
                    continue;
                }
                let composed = accumulated.compose(edge.transform);
                if next == source_frame {
                    return Ok(composed);
                }
                visited.insert(next);
                queue.push_back((next, composed));
            }
        }

        Err(stale.unwrap_or_else(|| TransformError::Disconnected {
            target_frame: target_frame.to_string(),
            source_frame: source_frame.to_string(),
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SharedTfEngine
// ────────────────────────────────────────────────────────────────────────────

/// A [`TfEngine`] shared between the task that applies live updates and the
/// fusion cycle that reads it.  Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct SharedTfEngine(Arc<RwLock<TfEngine>>);

impl SharedTfEngine {
    pub fn new(engine: TfEngine) -> Self {
        Self(Arc::new(RwLock::new(engine)))
    }

    /// Run `f` with exclusive access to the tree.
    pub fn update<R>(&self, f: impl FnOnce(&mut TfEngine) -> R) -> R {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl TransformProvider for SharedTfEngine {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
        time: LookupTime,
    ) -> Result<Transform3D, TransformError> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(target_frame, source_frame, time)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
