//! OpenCL sources for the full primitive set, compiled into one program at
//! device construction. Argument orders are part of the kernel ABI and must
//! not be reordered.

pub const KERNELS: &str = r#"
__kernel void mat_mul(uint m, uint n, uint p,
                      __global const float* a,
                      __global const float* b,
                      __global float* out) {
    uint id = get_global_id(0);
    if(id < m * p) {
        uint i = id / p;
        uint j = id % p;
        float sum = 0.;
        for(uint k = 0; k < n; k++) {
            sum += a[i * n + k] * b[k * p + j];
        }
        out[id] = sum;
    }
}

__kernel void row_softmax(uint rows, uint cols,
                          __global const float* inp,
                          __global float* out) {
    uint id = get_global_id(0);
    if(id < rows) {
        __global const float* x = inp + id * cols;
        __global float* y = out + id * cols;
        float mx = x[0];
        for(uint i = 1; i < cols; i++) {
            if(x[i] > mx) {
                mx = x[i];
            }
        }
        float sum = 0.;
        for(uint i = 0; i < cols; i++) {
            sum += exp(x[i] - mx);
        }
        for(uint i = 0; i < cols; i++) {
            y[i] = exp(x[i] - mx) / sum;
        }
    }
}

__kernel void row_softmax_backward(uint rows, uint cols,
                                   __global const float* a,
                                   __global const float* da,
                                   __global float* out) {
    uint id = get_global_id(0);
    if(id < rows) {
        __global const float* y = a + id * cols;
        __global const float* dy = da + id * cols;
        __global float* dx = out + id * cols;
        float dot = 0.;
        for(uint i = 0; i < cols; i++) {
            dot += dy[i] * y[i];
        }
        for(uint i = 0; i < cols; i++) {
            dx[i] = (dy[i] - dot) * y[i];
        }
    }
}

__kernel void transpose(uint rows, uint cols,
                        __global const float* inp,
                        __global float* out) {
    uint id = get_global_id(0);
    if(id < rows * cols) {
        uint i = id / cols;
        uint j = id % cols;
        out[j * rows + i] = inp[id];
    }
}

__kernel void scale_in_place(__global float* buf, float s,
                             uint rows, uint cols) {
    uint id = get_global_id(0);
    if(id < rows * cols) {
        buf[id] *= s;
    }
}

__kernel void embedding_gather(__global const int* ids,
                               __global const float* table,
                               __global float* out,
                               uint dim) {
    uint id = get_global_id(0);
    uint t = (uint)ids[id];
    for(uint j = 0; j < dim; j++) {
        out[id * dim + j] = table[t * dim + j];
    }
}

__kernel void rotary(__global float* buf, uint rows, uint dim) {
    uint id = get_global_id(0);
    if(id < rows) {
        __global float* row = buf + id * dim;
        for(uint i = 0; i < dim; i += 2) {
            float angle = (float)id / pow(10000.0f, 2.0f * i / dim);
            float c = cos(angle);
            float s = sin(angle);
            float even = row[i];
            float odd = (i + 1 < dim) ? row[i + 1] : 0.0f;
            row[i] = even * c - odd * s;
            if(i + 1 < dim) {
                row[i + 1] = even * s + odd * c;
            }
        }
    }
}

__kernel void layer_norm_forward(__global const float* x,
                                 __global float* y,
                                 __global float* mean,
                                 __global float* invstd,
                                 uint rows, uint cols, float eps) {
    uint id = get_global_id(0);
    if(id < rows) {
        __global const float* inp = x + id * cols;
        __global float* out = y + id * cols;
        float mu = 0.;
        for(uint j = 0; j < cols; j++) {
            mu += inp[j];
        }
        mu /= cols;
        float var = 0.;
        for(uint j = 0; j < cols; j++) {
            float z = inp[j] - mu;
            var += z * z;
        }
        var /= cols;
        float inv = 1.0f / sqrt(var + eps);
        for(uint j = 0; j < cols; j++) {
            out[j] = (inp[j] - mu) * inv;
        }
        mean[id] = mu;
        invstd[id] = inv;
    }
}

__kernel void layer_norm_backward(__global const float* x,
                                  __global const float* dy,
                                  __global const float* mean,
                                  __global const float* invstd,
                                  __global float* dx,
                                  uint rows, uint cols) {
    uint id = get_global_id(0);
    if(id < rows) {
        __global const float* xr = x + id * cols;
        __global const float* dyr = dy + id * cols;
        __global float* dxr = dx + id * cols;
        float mu = mean[id];
        float inv = invstd[id];
        float sum_dy = 0.;
        float sum_dy_xhat = 0.;
        for(uint j = 0; j < cols; j++) {
            float xhat = (xr[j] - mu) * inv;
            sum_dy += dyr[j];
            sum_dy_xhat += dyr[j] * xhat;
        }
        for(uint j = 0; j < cols; j++) {
            float xhat = (xr[j] - mu) * inv;
            dxr[j] = 1.0f / cols * inv * (cols * dyr[j] - sum_dy - xhat * sum_dy_xhat);
        }
    }
}
"#;
