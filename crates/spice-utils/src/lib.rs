mod assert;
