use std::ops::{Add, Mul, Neg, Sub};

use bytemuck::{Pod, Zeroable};
use num::{Float, Num, One, Zero};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Vector2<T> {
    pub x: T,
    pub y: T,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Vector3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Vector4<T> {
    pub x: T,
    pub y: T,
    pub z: T,
    pub w: T,
}

/// Column-major 4x4 matrix, laid out the way std140 uniform blocks expect.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Matrix4<T> {
    pub cols: [Vector4<T>; 4],
}

// SAFETY: `#[repr(C)]` structs made only of `T: Pod` fields, without padding.
unsafe impl<T: Zeroable> Zeroable for Vector2<T> {}
unsafe impl<T: Pod> Pod for Vector2<T> {}
unsafe impl<T: Zeroable> Zeroable for Vector3<T> {}
unsafe impl<T: Pod> Pod for Vector3<T> {}
unsafe impl<T: Zeroable> Zeroable for Vector4<T> {}
unsafe impl<T: Pod> Pod for Vector4<T> {}
unsafe impl<T: Zeroable> Zeroable for Matrix4<T> {}
unsafe impl<T: Pod> Pod for Matrix4<T> {}

impl<T> Vector2<T> {
    pub const fn new(x: T, y: T) -> Self {
        Self { x, y }
    }
}

impl<T> Vector3<T> {
    pub const fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }
}

impl<T> Vector4<T> {
    pub const fn new(x: T, y: T, z: T, w: T) -> Self {
        Self { x, y, z, w }
    }
}

impl<T: Num + Copy> Vector2<T> {
    pub fn dot(self, rhs: Self) -> T {
        self.x * rhs.x + self.y * rhs.y
    }
}

impl<T: Num + Copy> Vector3<T> {
    pub fn dot(self, rhs: Self) -> T {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self {
            x: self.y * rhs.z - self.z * rhs.y,
            y: self.z * rhs.x - self.x * rhs.z,
            z: self.x * rhs.y - self.y * rhs.x,
        }
    }

    pub fn extend(self, w: T) -> Vector4<T> {
        Vector4::new(self.x, self.y, self.z, w)
    }
}

impl<T: Float> Vector3<T> {
    pub fn length(self) -> T {
        self.dot(self).sqrt()
    }

    pub fn normalized(self) -> Self {
        let len = self.length();
        if len == T::zero() {
            self
        } else {
            self * (T::one() / len)
        }
    }
}

impl<T: Num + Copy> Add for Vector2<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl<T: Num + Copy> Sub for Vector2<T> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl<T: Num + Copy> Mul<T> for Vector2<T> {
    type Output = Self;

    fn mul(self, rhs: T) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl<T: Num + Copy> Add for Vector3<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl<T: Num + Copy> Sub for Vector3<T> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl<T: Num + Copy> Mul<T> for Vector3<T> {
    type Output = Self;

    fn mul(self, rhs: T) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl<T: Num + Copy + Neg<Output = T>> Neg for Vector3<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl<T: Zero + One + Copy> Matrix4<T> {
    pub fn identity() -> Self {
        let (o, l) = (T::zero(), T::one());
        Self {
            cols: [
                Vector4::new(l, o, o, o),
                Vector4::new(o, l, o, o),
                Vector4::new(o, o, l, o),
                Vector4::new(o, o, o, l),
            ],
        }
    }

    pub fn translation(offset: Vector3<T>) -> Self {
        let mut m = Self::identity();
        m.cols[3] = Vector4::new(offset.x, offset.y, offset.z, T::one());
        m
    }

    pub fn scale(factor: Vector3<T>) -> Self {
        let mut m = Self::identity();
        m.cols[0].x = factor.x;
        m.cols[1].y = factor.y;
        m.cols[2].z = factor.z;
        m
    }
}

impl<T: Num + Copy> Mul for Matrix4<T> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let row = |m: &Self, r: usize| -> [T; 4] {
            let pick = |c: &Vector4<T>| match r {
                0 => c.x,
                1 => c.y,
                2 => c.z,
                _ => c.w,
            };
            [pick(&m.cols[0]), pick(&m.cols[1]), pick(&m.cols[2]), pick(&m.cols[3])]
        };
        let dot4 = |a: [T; 4], b: &Vector4<T>| a[0] * b.x + a[1] * b.y + a[2] * b.z + a[3] * b.w;

        let rows = [row(&self, 0), row(&self, 1), row(&self, 2), row(&self, 3)];
        let mut cols = rhs.cols;
        for (dst, src) in cols.iter_mut().zip(rhs.cols.iter()) {
            *dst = Vector4::new(
                dot4(rows[0], src),
                dot4(rows[1], src),
                dot4(rows[2], src),
                dot4(rows[3], src),
            );
        }
        Self { cols }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_of_axes_is_third_axis() {
        let x = Vector3::new(1.0f32, 0.0, 0.0);
        let y = Vector3::new(0.0f32, 1.0, 0.0);
        assert_eq!(x.cross(y), Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn translation_composes_with_scale() {
        let t = Matrix4::translation(Vector3::new(1.0f32, 2.0, 3.0));
        let s = Matrix4::scale(Vector3::new(2.0f32, 2.0, 2.0));
        let m = t * s;
        assert_eq!(m.cols[0].x, 2.0);
        assert_eq!(m.cols[3], Vector4::new(1.0, 2.0, 3.0, 1.0));
        assert_eq!(Matrix4::<f32>::identity() * m, m);
    }

    #[test]
    fn matrix_is_sixty_four_bytes() {
        let m = Matrix4::<f32>::identity();
        assert_eq!(bytemuck::bytes_of(&m).len(), 64);
    }
}
