//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::backprop_fns::BackpropFunc;

type SharedValue = Rc<RefCell<InnerValue>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Newtype representing a shared value in a computation graph
///
/// Cloning a `Value` clones the handle, not the node: both clones observe the
/// same data and gradient.
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new leaf value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None, vec![]))))
    }

    fn derived(data: f32, backprop_fn: BackpropFunc, operands: &[&Value]) -> Self {
        let children = operands.iter().map(|v| v.0.clone()).collect();
        Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
            children,
        ))))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    /// `true` if this value was not produced by an operation
    pub fn is_leaf(&self) -> bool {
        self.0.borrow().backprop_fn.is_none()
    }

    // &mut is not required by the RefCell, it signals that the caller owns the update
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    pub(crate) fn add_grad(&self, delta: f32) {
        self.0.borrow_mut().grad += delta;
    }

    /// Zeros the gradient of this value and of every value it was computed from
    ///
    /// Unlike PyTorch this reaches intermediate nodes as well as leaves.
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    /// Backpropagates from this value, accumulating `d self / d v` into every `v` it depends on
    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // root first, so every node's gradient is complete before it is propagated
        for value in self.topological_order().into_iter().rev() {
            let (backprop_fn, operands) = {
                let inner = value.0.borrow();
                let operands = inner
                    .children
                    .iter()
                    .map(|c| Value(c.clone()))
                    .collect::<Vec<_>>();
                (inner.backprop_fn, operands)
            };
            if let Some(f) = backprop_fn {
                f.apply(&operands, &value);
            }
        }
    }

    /// Post-order over the graph: operands always precede the values computed from them.
    ///
    /// Iterative, graphs built from long sums are too deep for recursion.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            stack.push((value.clone(), true));
            for child in value.0.borrow().children.iter() {
                if !visited.contains(&child.borrow().id) {
                    stack.push((Value(child.clone()), false));
                }
            }
        }
        order
    }
}

// Various operations on values
impl Value {
    pub fn pow(&self, exponent: &Value) -> Value {
        Value::derived(
            self.data().powf(exponent.data()),
            BackpropFunc::Pow,
            &[self, exponent],
        )
    }

    pub fn relu(&self) -> Value {
        Value::derived(self.data().max(0.0), BackpropFunc::ReLU, &[self])
    }

    pub fn exp(&self) -> Value {
        Value::derived(self.data().exp(), BackpropFunc::Exp, &[self])
    }

    /// Natural logarithm
    pub fn ln(&self) -> Value {
        Value::derived(self.data().ln(), BackpropFunc::Ln, &[self])
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        write!(f, "Value(data={}, grad={}", inner.data, inner.grad)?;
        if let Some(op) = inner.backprop_fn {
            write!(f, ", op={:?}", op)?;
        }
        write!(f, ")")
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        Value::derived(self.data() + other.data(), BackpropFunc::Add, &[self, other])
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        Value::derived(self.data() - other.data(), BackpropFunc::Sub, &[self, other])
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        Value::derived(self.data() * other.data(), BackpropFunc::Mul, &[self, other])
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        Value::derived(self.data() / other.data(), BackpropFunc::Div, &[self, other])
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        Value::derived(-self.data(), BackpropFunc::Neg, &[self])
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Value::new(0.0), |acc, v| &acc + &v)
    }
}

/// Implements an operator on owned `Value`s by delegating to the reference impl
macro_rules! impl_owned_op(
    ($trait:ident, $trait_method:ident, $operator:tt) => {
        impl $trait for Value {
            type Output = Value;

            fn $trait_method(self, other: Value) -> Value {
                &self $operator &other
            }
        }
    }
);
impl_owned_op!(Add, add, +);
impl_owned_op!(Sub, sub, -);
impl_owned_op!(Mul, mul, *);
impl_owned_op!(Div, div, /);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    // 32 bit floats, roughly 7 significant decimal digits
    pub(crate) data: f32,
    /// gradient of the backward root with respect to this value
    pub(crate) grad: f32,
    /// Operands of the forward operation, "children" in the backward pass
    children: Vec<SharedValue>,
    id: u64,
    /// `None` for leaf nodes
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    fn new(data: f32, backprop_fn: Option<BackpropFunc>, children: Vec<SharedValue>) -> Self {
        Self {
            data,
            grad: 0.0,
            children,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn,
        }
    }
}

// Dropping a deep graph through the default recursive drop overflows the stack,
// so uniquely owned children are unlinked iteratively instead
impl Drop for InnerValue {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(child) = pending.pop() {
            if let Ok(cell) = Rc::try_unwrap(child) {
                let mut inner = cell.into_inner();
                pending.append(&mut inner.children);
            }
        }
    }
}
