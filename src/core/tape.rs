// Wengert tape: reverse-mode differentiation by operation recording.
//
// A tape lives for exactly one simulation window. Parameters and window
// inputs are copied onto it as leaves, the model and the cost record their
// arithmetic, and `backward` replays the ops in reverse. Dropping the tape
// drops every gradient path, so nothing recorded here can reach an earlier
// window.

use crate::tensor::Tensor;

/// Arena index of a buffer on a [`Tape`].
pub type BufId = usize;

#[derive(Debug, Clone)]
struct TapeBuf {
    value: Tensor,
    is_param: bool,
}

#[derive(Debug, Clone)]
enum TapeOp {
    Add { a: BufId, b: BufId, out: BufId },
    Sub { a: BufId, b: BufId, out: BufId },
    Mul { a: BufId, b: BufId, out: BufId },
    Div { a: BufId, b: BufId, out: BufId },
    Scale { input: BufId, scalar: f32, out: BufId },
    AddScalar { input: BufId, out: BufId },
    Exp { input: BufId, out: BufId },
    Tanh { input: BufId, out: BufId },
    Sigmoid { input: BufId, out: BufId },
    Sqrt { input: BufId, out: BufId },
    Square { input: BufId, out: BufId },
    /// Broadcast a one-element buffer to `len` elements.
    Expand { input: BufId, out: BufId },
    Sum { input: BufId, out: BufId },
    Mean { input: BufId, out: BufId },
    /// out[r] = sum_c w[r, c] * x[c]
    MatVec { w: BufId, x: BufId, out: BufId, rows: usize, cols: usize },
    /// in: [rows, cols] -> out: [cols, rows]
    Transpose { input: BufId, out: BufId, rows: usize, cols: usize },
    Concat { inputs: Vec<BufId>, out: BufId },
    Slice { input: BufId, out: BufId, offset: usize },
}

/// Reverse-mode AD tape over flat `f32` buffers.
///
/// Op methods assert operand sizes: a mismatch is a bug in the model or cost
/// recording the op, not a data error.
#[derive(Debug, Default)]
pub struct Tape {
    bufs: Vec<TapeBuf>,
    ops: Vec<TapeOp>,
    grads: Vec<Option<Vec<f32>>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: Tensor, is_param: bool) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf { value, is_param });
        self.grads.push(None);
        id
    }

    /// Register a trainable leaf. The tape keeps its own copy, so later
    /// optimizer updates do not alter what this window recorded.
    pub fn param(&mut self, value: &Tensor) -> BufId {
        self.push(value.clone(), true)
    }

    /// Register a constant leaf (state, delay history, stimulus, targets).
    pub fn input(&mut self, value: Tensor) -> BufId {
        self.push(value, false)
    }

    pub fn constant(&mut self, v: f32) -> BufId {
        self.push(Tensor::scalar(v), false)
    }

    pub fn value(&self, id: BufId) -> &Tensor {
        &self.bufs[id].value
    }

    pub fn data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].value.data
    }

    pub fn numel(&self, id: BufId) -> usize {
        self.bufs[id].value.numel()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].is_param
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Accumulated gradient, `None` if nothing flowed into `id`.
    pub fn grad(&self, id: BufId) -> Option<&[f32]> {
        self.grads[id].as_deref()
    }

    fn record(&mut self, value: Tensor, op: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out = self.push(value, false);
        let op = op(out);
        self.ops.push(op);
        out
    }

    fn same_len(&self, a: BufId, b: BufId) {
        assert_eq!(
            self.numel(a),
            self.numel(b),
            "tape operand size mismatch: {} vs {}",
            self.numel(a),
            self.numel(b)
        );
    }

    fn zip_map(&self, a: BufId, b: BufId, f: impl Fn(f32, f32) -> f32) -> Tensor {
        self.same_len(a, b);
        let va = self.value(a);
        let data = va
            .data
            .iter()
            .zip(self.data(b))
            .map(|(&x, &y)| f(x, y))
            .collect();
        Tensor {
            data,
            shape: va.shape.clone(),
        }
    }

    fn map(&self, input: BufId, f: impl Fn(f32) -> f32) -> Tensor {
        let v = self.value(input);
        Tensor {
            data: v.data.iter().map(|&x| f(x)).collect(),
            shape: v.shape.clone(),
        }
    }

    // ── Element-wise ────────────────────────────────────────────────

    pub fn add(&mut self, a: BufId, b: BufId) -> BufId {
        let v = self.zip_map(a, b, |x, y| x + y);
        self.record(v, |out| TapeOp::Add { a, b, out })
    }

    pub fn sub(&mut self, a: BufId, b: BufId) -> BufId {
        let v = self.zip_map(a, b, |x, y| x - y);
        self.record(v, |out| TapeOp::Sub { a, b, out })
    }

    pub fn mul(&mut self, a: BufId, b: BufId) -> BufId {
        let v = self.zip_map(a, b, |x, y| x * y);
        self.record(v, |out| TapeOp::Mul { a, b, out })
    }

    pub fn div(&mut self, a: BufId, b: BufId) -> BufId {
        let v = self.zip_map(a, b, |x, y| x / y);
        self.record(v, |out| TapeOp::Div { a, b, out })
    }

    pub fn scale(&mut self, input: BufId, scalar: f32) -> BufId {
        let v = self.map(input, |x| x * scalar);
        self.record(v, |out| TapeOp::Scale { input, scalar, out })
    }

    pub fn add_scalar(&mut self, input: BufId, scalar: f32) -> BufId {
        let v = self.map(input, |x| x + scalar);
        self.record(v, |out| TapeOp::AddScalar { input, out })
    }

    pub fn exp(&mut self, input: BufId) -> BufId {
        let v = self.map(input, f32::exp);
        self.record(v, |out| TapeOp::Exp { input, out })
    }

    pub fn tanh(&mut self, input: BufId) -> BufId {
        let v = self.map(input, f32::tanh);
        self.record(v, |out| TapeOp::Tanh { input, out })
    }

    pub fn sigmoid(&mut self, input: BufId) -> BufId {
        let v = self.map(input, |x| 1.0 / (1.0 + (-x).exp()));
        self.record(v, |out| TapeOp::Sigmoid { input, out })
    }

    pub fn sqrt(&mut self, input: BufId) -> BufId {
        let v = self.map(input, f32::sqrt);
        self.record(v, |out| TapeOp::Sqrt { input, out })
    }

    pub fn square(&mut self, input: BufId) -> BufId {
        let v = self.map(input, |x| x * x);
        self.record(v, |out| TapeOp::Square { input, out })
    }

    // ── Shape / reductions ──────────────────────────────────────────

    /// Broadcast a scalar buffer to a vector of `len` elements.
    pub fn expand(&mut self, input: BufId, len: usize) -> BufId {
        assert_eq!(self.numel(input), 1, "expand needs a scalar input");
        let x = self.data(input)[0];
        self.record(
            Tensor {
                data: vec![x; len],
                shape: vec![len],
            },
            |out| TapeOp::Expand { input, out },
        )
    }

    pub fn sum(&mut self, input: BufId) -> BufId {
        let s: f32 = self.data(input).iter().sum();
        self.record(Tensor::scalar(s), |out| TapeOp::Sum { input, out })
    }

    pub fn mean(&mut self, input: BufId) -> BufId {
        let n = self.numel(input).max(1) as f32;
        let s: f32 = self.data(input).iter().sum();
        self.record(Tensor::scalar(s / n), |out| TapeOp::Mean { input, out })
    }

    /// `w` is read as a row-major `[rows, cols]` matrix, `x` as `[cols]`.
    pub fn matvec(&mut self, w: BufId, x: BufId, rows: usize, cols: usize) -> BufId {
        assert_eq!(self.numel(w), rows * cols, "matvec matrix size");
        assert_eq!(self.numel(x), cols, "matvec vector size");
        let wd = self.data(w);
        let xd = self.data(x);
        let data = (0..rows)
            .map(|r| {
                wd[r * cols..(r + 1) * cols]
                    .iter()
                    .zip(xd)
                    .map(|(a, b)| a * b)
                    .sum()
            })
            .collect();
        self.record(
            Tensor {
                data,
                shape: vec![rows],
            },
            |out| TapeOp::MatVec {
                w,
                x,
                out,
                rows,
                cols,
            },
        )
    }

    /// Read `input` as `[rows, cols]` and produce its `[cols, rows]` transpose.
    pub fn transpose(&mut self, input: BufId, rows: usize, cols: usize) -> BufId {
        assert_eq!(self.numel(input), rows * cols, "transpose size");
        let d = self.data(input);
        let mut data = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = d[r * cols + c];
            }
        }
        self.record(
            Tensor {
                data,
                shape: vec![cols, rows],
            },
            |out| TapeOp::Transpose {
                input,
                out,
                rows,
                cols,
            },
        )
    }

    /// Flat concatenation of `inputs` in order.
    pub fn concat(&mut self, inputs: &[BufId]) -> BufId {
        let mut data = Vec::with_capacity(inputs.iter().map(|&i| self.numel(i)).sum());
        for &i in inputs {
            data.extend_from_slice(self.data(i));
        }
        let len = data.len();
        self.record(
            Tensor {
                data,
                shape: vec![len],
            },
            |out| TapeOp::Concat {
                inputs: inputs.to_vec(),
                out,
            },
        )
    }

    pub fn slice(&mut self, input: BufId, offset: usize, len: usize) -> BufId {
        assert!(offset + len <= self.numel(input), "slice out of range");
        let data = self.data(input)[offset..offset + len].to_vec();
        self.record(
            Tensor {
                data,
                shape: vec![len],
            },
            |out| TapeOp::Slice { input, out, offset },
        )
    }

    // ── Backward ────────────────────────────────────────────────────

    fn accumulate(&mut self, id: BufId, g: &[f32]) {
        if let Some(acc) = self.grads[id].as_mut() {
            for (a, x) in acc.iter_mut().zip(g) {
                *a += x;
            }
        } else {
            self.grads[id] = Some(g.to_vec());
        }
    }

    /// Replay the tape in reverse from a scalar `loss`.
    ///
    /// # Panics
    /// Panics if `loss` is not a one-element buffer.
    pub fn backward(&mut self, loss: BufId) {
        assert_eq!(self.numel(loss), 1, "backward needs a scalar loss");
        self.grads[loss] = Some(vec![1.0]);

        for idx in (0..self.ops.len()).rev() {
            let op = self.ops[idx].clone();
            self.backward_op(&op);
        }
    }

    fn backward_op(&mut self, op: &TapeOp) {
        let out = match op {
            TapeOp::Add { out, .. }
            | TapeOp::Sub { out, .. }
            | TapeOp::Mul { out, .. }
            | TapeOp::Div { out, .. }
            | TapeOp::Scale { out, .. }
            | TapeOp::AddScalar { out, .. }
            | TapeOp::Exp { out, .. }
            | TapeOp::Tanh { out, .. }
            | TapeOp::Sigmoid { out, .. }
            | TapeOp::Sqrt { out, .. }
            | TapeOp::Square { out, .. }
            | TapeOp::Expand { out, .. }
            | TapeOp::Sum { out, .. }
            | TapeOp::Mean { out, .. }
            | TapeOp::MatVec { out, .. }
            | TapeOp::Transpose { out, .. }
            | TapeOp::Concat { out, .. }
            | TapeOp::Slice { out, .. } => *out,
        };
        let Some(d) = self.grads[out].clone() else {
            return;
        };

        match op {
            TapeOp::Add { a, b, .. } => {
                self.accumulate(*a, &d);
                self.accumulate(*b, &d);
            }
            TapeOp::Sub { a, b, .. } => {
                self.accumulate(*a, &d);
                let neg: Vec<f32> = d.iter().map(|x| -x).collect();
                self.accumulate(*b, &neg);
            }
            TapeOp::Mul { a, b, .. } => {
                let da: Vec<f32> = d.iter().zip(self.data(*b)).map(|(g, y)| g * y).collect();
                let db: Vec<f32> = d.iter().zip(self.data(*a)).map(|(g, x)| g * x).collect();
                self.accumulate(*a, &da);
                self.accumulate(*b, &db);
            }
            TapeOp::Div { a, b, .. } => {
                let (xa, xb) = (self.data(*a), self.data(*b));
                let da: Vec<f32> = d.iter().zip(xb).map(|(g, y)| g / y).collect();
                let db: Vec<f32> = d
                    .iter()
                    .zip(xa.iter().zip(xb))
                    .map(|(g, (x, y))| -g * x / (y * y))
                    .collect();
                self.accumulate(*a, &da);
                self.accumulate(*b, &db);
            }
            TapeOp::Scale { input, scalar, .. } => {
                let di: Vec<f32> = d.iter().map(|g| g * scalar).collect();
                self.accumulate(*input, &di);
            }
            TapeOp::AddScalar { input, .. } => self.accumulate(*input, &d),
            TapeOp::Exp { input, out } => {
                let di: Vec<f32> = d.iter().zip(self.data(*out)).map(|(g, y)| g * y).collect();
                self.accumulate(*input, &di);
            }
            TapeOp::Tanh { input, out } => {
                let di: Vec<f32> = d
                    .iter()
                    .zip(self.data(*out))
                    .map(|(g, y)| g * (1.0 - y * y))
                    .collect();
                self.accumulate(*input, &di);
            }
            TapeOp::Sigmoid { input, out } => {
                let di: Vec<f32> = d
                    .iter()
                    .zip(self.data(*out))
                    .map(|(g, y)| g * y * (1.0 - y))
                    .collect();
                self.accumulate(*input, &di);
            }
            TapeOp::Sqrt { input, out } => {
                let di: Vec<f32> = d
                    .iter()
                    .zip(self.data(*out))
                    .map(|(g, y)| g * 0.5 / y)
                    .collect();
                self.accumulate(*input, &di);
            }
            TapeOp::Square { input, .. } => {
                let di: Vec<f32> = d
                    .iter()
                    .zip(self.data(*input))
                    .map(|(g, x)| 2.0 * g * x)
                    .collect();
                self.accumulate(*input, &di);
            }
            TapeOp::Expand { input, .. } => {
                let s: f32 = d.iter().sum();
                self.accumulate(*input, &[s]);
            }
            TapeOp::Sum { input, .. } => {
                let di = vec![d[0]; self.numel(*input)];
                self.accumulate(*input, &di);
            }
            TapeOp::Mean { input, .. } => {
                let n = self.numel(*input);
                let di = vec![d[0] / n.max(1) as f32; n];
                self.accumulate(*input, &di);
            }
            TapeOp::MatVec {
                w, x, rows, cols, ..
            } => {
                let (rows, cols) = (*rows, *cols);
                let wd = self.data(*w);
                let xd = self.data(*x);
                let mut dw = vec![0.0f32; rows * cols];
                let mut dx = vec![0.0f32; cols];
                for r in 0..rows {
                    let g = d[r];
                    for c in 0..cols {
                        dw[r * cols + c] = g * xd[c];
                        dx[c] += g * wd[r * cols + c];
                    }
                }
                self.accumulate(*w, &dw);
                self.accumulate(*x, &dx);
            }
            TapeOp::Transpose {
                input, rows, cols, ..
            } => {
                let (rows, cols) = (*rows, *cols);
                let mut di = vec![0.0f32; rows * cols];
                for r in 0..rows {
                    for c in 0..cols {
                        di[r * cols + c] = d[c * rows + r];
                    }
                }
                self.accumulate(*input, &di);
            }
            TapeOp::Concat { inputs, .. } => {
                let mut offset = 0;
                for &i in inputs {
                    let n = self.numel(i);
                    self.accumulate(i, &d[offset..offset + n]);
                    offset += n;
                }
            }
            TapeOp::Slice { input, offset, .. } => {
                let mut di = vec![0.0f32; self.numel(*input)];
                di[*offset..*offset + d.len()].copy_from_slice(&d);
                self.accumulate(*input, &di);
            }
        }
    }
}
